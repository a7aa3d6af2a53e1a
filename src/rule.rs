/*
Copyright 2025 Google LLC

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

     https://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::fmt::Debug;

use bytes::Bytes;
use memchr::memchr;

use crate::loc::Loc;
use crate::symtab::Symbol;

/// One evaluated rule, as handed over by the evaluator. Commands are opaque
/// byte strings; `$<` and friends are expanded later by the executor.
#[derive(Clone)]
pub struct Rule {
    pub outputs: Vec<Symbol>,
    pub inputs: Vec<Symbol>,
    pub order_only_inputs: Vec<Symbol>,
    pub output_patterns: Vec<Symbol>,
    pub is_double_colon: bool,
    pub is_suffix_rule: bool,
    pub cmds: Vec<Bytes>,
    pub loc: Loc,
    pub cmd_loc: Option<Loc>,
}

impl Rule {
    pub fn new(loc: Loc, is_double_colon: bool) -> Self {
        Self {
            outputs: Vec::new(),
            inputs: Vec::new(),
            order_only_inputs: Vec::new(),
            output_patterns: Vec::new(),
            is_double_colon,
            is_suffix_rule: false,
            cmds: Vec::new(),
            loc,
            cmd_loc: None,
        }
    }
}

impl Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "outputs={:?} inputs={:?}", self.outputs, self.inputs)?;
        if !self.order_only_inputs.is_empty() {
            write!(f, " order_only_inputs={:?}", self.order_only_inputs)?;
        }
        if !self.output_patterns.is_empty() {
            write!(f, " output_patterns={:?}", self.output_patterns)?;
        }
        if self.is_double_colon {
            write!(f, " is_double_colon")?;
        }
        if self.is_suffix_rule {
            write!(f, " is_suffix_rule")?;
        }
        if !self.cmds.is_empty() {
            write!(f, " cmds={:?}", self.cmds)?;
        }
        Ok(())
    }
}

pub fn is_pattern_rule(target: &[u8]) -> bool {
    memchr(b'%', target).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_pattern_rule() {
        assert!(is_pattern_rule(b"%.o"));
        assert!(is_pattern_rule(b"lib%.a"));
        assert!(!is_pattern_rule(b"foo.o"));
    }
}
