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

//! Variable bindings as the planner sees them. The evaluator has already
//! expanded values to byte strings; what is left here is the assignment
//! operator of target-specific bindings and scoped save/restore while a
//! subtree is being planned.

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};

use crate::loc::Loc;
use crate::symtab::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Eq,
    ColonEq,
    PlusEq,
    QuestionEq,
}

pub type Var = Arc<RwLock<Variable>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    loc: Option<Loc>,

    /// Set on target-specific bindings; None on plain globals.
    pub assign_op: Option<AssignOp>,

    value: Bytes,
}

impl Variable {
    pub fn loc(&self) -> &Option<Loc> {
        &self.loc
    }

    pub fn string(&self) -> &Bytes {
        &self.value
    }

    pub fn with_simple_string(value: Bytes, loc: Option<Loc>) -> Var {
        Arc::new(RwLock::new(Self {
            loc,
            assign_op: None,
            value,
        }))
    }

    pub fn new_target_specific(value: Bytes, op: AssignOp, loc: Option<Loc>) -> Var {
        Arc::new(RwLock::new(Self {
            loc,
            assign_op: Some(op),
            value,
        }))
    }

    /// `+=` result: this variable's value, a single space, then `other`'s.
    pub fn append_var(&self, other: &Variable, loc: Option<Loc>) -> Var {
        let mut s = BytesMut::with_capacity(self.value.len() + other.value.len() + 1);
        s.put_slice(&self.value);
        if !s.is_empty() {
            s.put_u8(b' ');
        }
        s.put_slice(&other.value);
        Variable::with_simple_string(s.freeze(), loc)
    }
}

pub struct Vars(pub Mutex<HashMap<Symbol, Var>>);

impl Default for Vars {
    fn default() -> Self {
        Self::new()
    }
}

impl Vars {
    pub fn new() -> Self {
        Vars(Mutex::new(HashMap::new()))
    }

    pub fn lookup(&self, sym: Symbol) -> Option<Var> {
        self.0.lock().get(&sym).cloned()
    }

    pub fn set(&self, sym: Symbol, var: Var) {
        self.0.lock().insert(sym, var);
    }

    pub fn merge_from(&self, vars: &Vars) {
        let mut to = self.0.lock();
        let from = vars.0.lock();

        for (sym, var) in from.iter() {
            to.insert(*sym, var.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

impl Clone for Vars {
    fn clone(&self) -> Self {
        let m = self.0.lock();
        Self(Mutex::new(m.clone()))
    }
}

impl Debug for Vars {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let vars = self.0.lock();
        f.debug_map().entries(vars.iter()).finish()
    }
}

/// Saves one slot of a [`Vars`] table and restores it when dropped. Applying
/// a target-specific variable takes one of these per touched store, so the
/// binding is visible while the target's subtree is planned and undone on
/// every exit path.
pub struct ScopedVar {
    vars: Arc<Vars>,
    sym: Symbol,
    orig: Option<Var>,
}

impl ScopedVar {
    pub fn new(vars: Arc<Vars>, sym: Symbol, var: Var) -> Self {
        let orig = {
            let mut vars = vars.0.lock();
            vars.insert(sym, var)
        };
        Self { vars, sym, orig }
    }
}

impl Drop for ScopedVar {
    fn drop(&mut self) {
        let mut vars = self.vars.0.lock();
        if let Some(orig) = self.orig.clone() {
            vars.insert(self.sym, orig);
        } else {
            vars.remove(&self.sym);
        }
    }
}
