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

//! Builds the dependency graph. Evaluated rules are indexed into explicit,
//! implicit (pattern) and suffix tables, then the planner walks from the
//! goals, picks the applicable rule per target, applies target-specific
//! variables to the subtree being planned, and emits one memoised
//! [`DepNode`] per output.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use memchr::memchr;
use parking_lot::Mutex;

use crate::{
    error, error_loc,
    flags::FLAGS,
    loc::Loc,
    log,
    pathutil::PathCache,
    rule::Rule,
    strutil::{Pattern, get_ext, normalize_path, strip_ext},
    symtab::{PHONY_SYM, Symbol, intern, join_symbols},
    var::{AssignOp, ScopedVar, Vars},
    warn_loc,
};

/// What the evaluator hands over: the evaluated rules plus the
/// target-specific variable bindings keyed by output name.
pub struct EvalResult {
    pub rules: Vec<Rule>,
    pub rule_vars: HashMap<Symbol, Arc<Vars>>,
}

pub type NamedDepNode = (Symbol, Arc<Mutex<DepNode>>);

#[derive(Debug)]
pub struct DepNode {
    pub output: Symbol,
    pub cmds: Vec<Bytes>,
    /// Prerequisite nodes, in source order, order-only ones last.
    pub deps: Vec<NamedDepNode>,
    pub has_rule: bool,
    /// True when the first reference to this node was an order-only edge.
    /// Later references never change it.
    pub is_order_only: bool,
    /// Inputs after pattern/suffix substitution; `$<` and `$^` expand
    /// against these.
    pub actual_inputs: Vec<Symbol>,
    pub target_specific_vars: Option<Arc<Vars>>,
    pub loc: Option<Loc>,
}

impl DepNode {
    fn new(output: Symbol) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            output,
            cmds: Vec::new(),
            deps: Vec::new(),
            has_rule: false,
            is_order_only: false,
            actual_inputs: Vec::new(),
            target_specific_vars: None,
            loc: None,
        }))
    }
}

/// Which selection layer fired, plus the node count. Readable through
/// [`DepBuilder::stats`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DepStats {
    pub node_cnt: usize,
    pub pick_explicit_rule_cnt: usize,
    pub pick_implicit_rule_cnt: usize,
    pub pick_suffix_rule_cnt: usize,
    pub pick_explicit_rule_without_cmd_cnt: usize,
}

fn replace_suffix(s: Symbol, newsuf: Symbol) -> Symbol {
    let s = s.as_bytes();
    let s = strip_ext(&s);
    let newsuf = newsuf.as_bytes();
    let mut r = BytesMut::with_capacity(s.len() + newsuf.len() + 1);
    r.put_slice(s);
    r.put_u8(b'.');
    r.put_slice(&newsuf);
    intern(r.freeze())
}

/// `.IN.OUT` with exactly two dots and nothing else is the suffix-rule
/// shape.
fn is_suffix_rule_shape(output: &[u8]) -> bool {
    if !output.starts_with(b".") {
        return false;
    }
    let rest = &output[1..];
    let Some(dot_index) = memchr(b'.', rest) else {
        return false;
    };
    memchr(b'.', &rest[dot_index + 1..]).is_none()
}

fn merge_rules(old_rule: &Rule, rule: &Rule, output: Symbol, is_suffix_rule: bool) -> Result<Rule> {
    if old_rule.is_double_colon != rule.is_double_colon {
        error_loc!(
            Some(&rule.loc),
            "*** target file `{output}' has both : and :: entries."
        );
    }
    if !old_rule.cmds.is_empty() && !rule.cmds.is_empty() && !is_suffix_rule && !rule.is_double_colon
    {
        warn_loc!(
            rule.cmd_loc.as_ref().or(Some(&rule.loc)),
            "warning: overriding commands for target `{output}'"
        );
        warn_loc!(
            old_rule.cmd_loc.as_ref().or(Some(&old_rule.loc)),
            "warning: ignoring old commands for target `{output}'"
        );
    }

    let mut r = rule.clone();
    if rule.is_double_colon {
        let mut cmds = old_rule.cmds.clone();
        cmds.append(&mut r.cmds);
        r.cmds = cmds;
    } else if !old_rule.cmds.is_empty() && rule.cmds.is_empty() {
        r.cmds = old_rule.cmds.clone();
    }
    // If the latter rule has commands, its inputs take priority over the
    // old rule's.
    if !rule.cmds.is_empty() {
        r.inputs.extend(old_rule.inputs.iter().cloned());
        r.order_only_inputs
            .extend(old_rule.order_only_inputs.iter().cloned());
    } else {
        let mut inputs = old_rule.inputs.clone();
        inputs.append(&mut r.inputs);
        r.inputs = inputs;
        let mut order_only_inputs = old_rule.order_only_inputs.clone();
        order_only_inputs.append(&mut r.order_only_inputs);
        r.order_only_inputs = order_only_inputs;
    }
    r.output_patterns
        .extend(old_rule.output_patterns.iter().cloned());
    Ok(r)
}

type SuffixRuleMap = HashMap<Bytes, Vec<Arc<Rule>>>;

pub struct DepBuilder<'a> {
    paths: &'a PathCache,
    rules: HashMap<Symbol, Arc<Rule>>,
    rule_vars: HashMap<Symbol, Arc<Vars>>,

    implicit_rules: Vec<Arc<Rule>>,
    suffix_rules: SuffixRuleMap,

    first_rule: Option<Symbol>,
    vars: Arc<Vars>,
    done: HashMap<Symbol, Arc<Mutex<DepNode>>>,
    phony: HashSet<Symbol>,

    trace: Vec<Symbol>,
    stats: DepStats,
}

impl<'a> DepBuilder<'a> {
    pub fn new(er: EvalResult, vars: Arc<Vars>, paths: &'a PathCache) -> Result<Self> {
        let mut db = Self {
            paths,
            rules: HashMap::new(),
            rule_vars: er.rule_vars,
            implicit_rules: Vec::new(),
            suffix_rules: HashMap::new(),
            first_rule: None,
            vars,
            done: HashMap::new(),
            phony: HashSet::new(),
            trace: Vec::new(),
            stats: DepStats::default(),
        };
        db.populate_rules(er.rules)?;
        db.populate_phony();
        Ok(db)
    }

    pub fn stats(&self) -> &DepStats {
        &self.stats
    }

    fn populate_rules(&mut self, rules: Vec<Rule>) -> Result<()> {
        for mut rule in rules {
            for input in rule.inputs.iter_mut() {
                *input = intern(normalize_path(&input.as_bytes()));
            }
            for input in rule.order_only_inputs.iter_mut() {
                *input = intern(normalize_path(&input.as_bytes()));
            }
            if rule.outputs.is_empty() {
                self.populate_implicit_rule(rule);
            } else {
                self.populate_explicit_rule(rule)?;
            }
        }
        Ok(())
    }

    fn populate_explicit_rule(&mut self, mut rule: Rule) -> Result<()> {
        rule.outputs = rule
            .outputs
            .iter()
            .map(|o| intern(normalize_path(&o.as_bytes())))
            .collect();
        if self.first_rule.is_none()
            && let Some(first) = rule.outputs.first()
            && !first.as_bytes().starts_with(b".")
        {
            self.first_rule = Some(*first);
        }
        let rule = Arc::new(rule);
        for output in &rule.outputs {
            let is_suffix_rule = self.populate_suffix_rule(&rule, *output);
            if let Some(old_rule) = self.rules.get(output) {
                let r = merge_rules(old_rule, &rule, *output, is_suffix_rule)?;
                self.rules.insert(*output, Arc::new(r));
            } else {
                self.rules.insert(*output, rule.clone());
            }
        }
        Ok(())
    }

    fn populate_suffix_rule(&mut self, rule: &Rule, output: Symbol) -> bool {
        let output_str = output.as_bytes();
        if !is_suffix_rule_shape(&output_str) {
            return false;
        }
        let rest = output_str.slice(1..);
        let dot_index = memchr(b'.', &rest).unwrap();
        let input_suffix = rest.slice(..dot_index);
        let output_suffix = rest.slice(dot_index + 1..);

        let mut r = rule.clone();
        r.inputs = vec![intern(input_suffix)];
        r.is_suffix_rule = true;
        // Most recently defined rules win, so the front of the list.
        self.suffix_rules
            .entry(output_suffix)
            .or_default()
            .insert(0, Arc::new(r));
        true
    }

    fn populate_implicit_rule(&mut self, rule: Rule) {
        for output_pattern in rule.output_patterns.clone() {
            let mut r = rule.clone();
            r.output_patterns = vec![output_pattern];
            self.implicit_rules.push(Arc::new(r));
        }
    }

    fn populate_phony(&mut self) {
        if let Some(rule) = self.rules.get(&*PHONY_SYM) {
            for input in &rule.inputs {
                self.phony.insert(*input);
            }
        }
    }

    fn exists(&self, target: Symbol) -> bool {
        self.rules.contains_key(&target)
            || self.phony.contains(&target)
            || self.paths.exists(&target.as_bytes())
    }

    fn can_pick_implicit_rule(&self, rule: &Rule, output: Symbol) -> bool {
        let output_str = output.as_bytes();
        let pat = Pattern::new(rule.output_patterns[0].as_bytes());
        if !pat.matches(&output_str) {
            return false;
        }
        for input in &rule.inputs {
            let input = pat.append_subst(&output_str, &input.as_bytes());
            if !self.exists(intern(input)) {
                return false;
            }
        }
        true
    }

    /// Implicit-rule vars (keyed by the pattern) sit underneath any
    /// target-specific vars.
    fn merge_implicit_rule_vars(
        &self,
        outputs: &[Symbol],
        vars: Option<Arc<Vars>>,
    ) -> Result<Option<Arc<Vars>>> {
        if outputs.len() != 1 {
            error!("*** implicit rule should have only one output but {outputs:?}");
        }
        let Some(ivars) = self.rule_vars.get(&outputs[0]) else {
            return Ok(vars);
        };
        let Some(vars) = vars else {
            return Ok(Some(ivars.clone()));
        };
        let v = Vars::new();
        v.merge_from(ivars);
        v.merge_from(&vars);
        Ok(Some(Arc::new(v)))
    }

    /// The selection priority is strict: an explicit rule with commands,
    /// then applicable implicit rules (most recent definition first), then
    /// suffix rules, then a commandless explicit rule, then nothing.
    fn pick_rule(&mut self, output: Symbol) -> Result<Option<(Arc<Rule>, Option<Arc<Vars>>)>> {
        let rule = self.rules.get(&output).cloned();
        let mut vars = self.rule_vars.get(&output).cloned();
        if let Some(rule) = &rule {
            self.stats.pick_explicit_rule_cnt += 1;
            if !rule.cmds.is_empty() {
                return Ok(Some((rule.clone(), vars)));
            }
            // If none of the explicit rules for a target has commands,
            // make searches for an applicable implicit rule to find some.
            self.stats.pick_explicit_rule_without_cmd_cnt += 1;
        }

        for i in (0..self.implicit_rules.len()).rev() {
            let irule = self.implicit_rules[i].clone();
            if !self.can_pick_implicit_rule(&irule, output) {
                continue;
            }
            self.stats.pick_implicit_rule_cnt += 1;
            if let Some(rule) = &rule {
                let mut r = (**rule).clone();
                r.output_patterns = irule.output_patterns.clone();
                // The implicit rule's prerequisites will be used for $<.
                let mut inputs = irule.inputs.clone();
                inputs.append(&mut r.inputs);
                r.inputs = inputs;
                r.cmds = irule.cmds.clone();
                r.cmd_loc = irule.cmd_loc.clone();
                return Ok(Some((Arc::new(r), vars)));
            }
            if vars.is_some() {
                vars = self.merge_implicit_rule_vars(&irule.output_patterns, vars)?;
            }
            return Ok(Some((irule, vars)));
        }

        let output_str = output.as_bytes();
        let Some(output_suffix) = get_ext(&output_str) else {
            return Ok(rule.map(|r| (r, vars)));
        };
        let output_suffix = Bytes::copy_from_slice(&output_suffix[1..]);
        let Some(found) = self.suffix_rules.get(&output_suffix).cloned() else {
            return Ok(rule.map(|r| (r, vars)));
        };

        for irule in found {
            if irule.inputs.len() != 1 {
                error!(
                    "*** unexpected number of inputs for a suffix rule ({})",
                    irule.inputs.len()
                );
            }
            let input = replace_suffix(output, irule.inputs[0]);
            if !self.exists(input) {
                continue;
            }
            self.stats.pick_suffix_rule_cnt += 1;
            if let Some(rule) = &rule {
                let mut r = (**rule).clone();
                let mut inputs = Vec::with_capacity(r.inputs.len() + 1);
                inputs.push(input);
                inputs.append(&mut r.inputs);
                r.inputs = inputs;
                r.cmds = irule.cmds.clone();
                r.cmd_loc = irule.cmd_loc.clone();
                return Ok(Some((Arc::new(r), vars)));
            }
            if vars.is_some() {
                vars = self.merge_implicit_rule_vars(&irule.outputs, vars)?;
            }
            return Ok(Some((irule, vars)));
        }

        Ok(rule.map(|r| (r, vars)))
    }

    fn resolve_input(&self, rule: &Rule, output: Symbol, input: Symbol) -> Result<Symbol> {
        if !rule.output_patterns.is_empty() {
            if rule.output_patterns.len() > 1 {
                error!("*** multiple output patterns are not supported");
            }
            let pat = Pattern::new(rule.output_patterns[0].as_bytes());
            return Ok(intern(
                pat.append_subst(&output.as_bytes(), &input.as_bytes()),
            ));
        }
        if rule.is_suffix_rule {
            return Ok(replace_suffix(output, input));
        }
        Ok(input)
    }

    fn build_plan(
        &mut self,
        output: Symbol,
        needed_by: Option<Symbol>,
        tsvs: &Arc<Vars>,
    ) -> Result<Arc<Mutex<DepNode>>> {
        log!("build plan: {output} for {needed_by:?}");
        self.stats.node_cnt += 1;
        if self.stats.node_cnt % 100 == 0 {
            self.report_stats();
        }

        if let Some(found) = self.done.get(&output) {
            return Ok(found.clone());
        }
        let n = DepNode::new(output);
        self.done.insert(output, n.clone());

        let Some((rule, vars)) = self.pick_rule(output)? else {
            return Ok(n);
        };

        // Undo records for the variable stores; dropped when the whole
        // subtree below this node has been planned.
        let mut sv = Vec::new();
        if let Some(vars) = &vars {
            for (name, var) in vars.0.lock().iter() {
                let mut new_var = var.clone();
                let op = var.read().assign_op;
                match op {
                    Some(AssignOp::PlusEq) => {
                        if let Some(old_var) = self.vars.lookup(*name) {
                            let old = old_var.read();
                            if !old.string().is_empty() {
                                new_var = old.append_var(&var.read(), old.loc().clone());
                            }
                        }
                    }
                    Some(AssignOp::QuestionEq) => {
                        if self.vars.lookup(*name).is_some() {
                            continue;
                        }
                    }
                    _ => {}
                }
                sv.push(ScopedVar::new(self.vars.clone(), *name, new_var.clone()));
                sv.push(ScopedVar::new(tsvs.clone(), *name, new_var));
            }
        }

        log!("build plan: {output} inputs:{:?}", rule.inputs);
        let mut actual_inputs = Vec::with_capacity(rule.inputs.len());
        for input in &rule.inputs {
            let input = self.resolve_input(&rule, output, *input)?;
            actual_inputs.push(input);

            self.trace.push(input);
            let c = self.build_plan(input, Some(output), tsvs)?;
            self.trace.pop();
            n.lock().deps.push((input, c));
        }

        for input in &rule.order_only_inputs {
            let input = self.resolve_input(&rule, output, *input)?;
            // The order-only attribute sticks to the node, so only the
            // reference that creates the node decides it.
            let first_reference = !self.done.contains_key(&input);

            self.trace.push(input);
            let c = self.build_plan(input, Some(output), tsvs)?;
            self.trace.pop();
            if first_reference {
                c.lock().is_order_only = true;
            }
            n.lock().deps.push((input, c));
        }

        {
            let mut n = n.lock();
            n.has_rule = true;
            n.cmds = rule.cmds.clone();
            n.actual_inputs = actual_inputs;
            let snapshot = Vars::new();
            snapshot.merge_from(tsvs);
            n.target_specific_vars = Some(Arc::new(snapshot));
            if !rule.cmds.is_empty()
                && let Some(cmd_loc) = &rule.cmd_loc
            {
                n.loc = Some(cmd_loc.clone());
            } else {
                n.loc = Some(rule.loc.clone());
            }
        }
        Ok(n)
    }

    pub fn build(&mut self, mut targets: Vec<Symbol>) -> Result<Vec<NamedDepNode>> {
        if targets.is_empty() {
            let Some(first_rule) = self.first_rule else {
                error!("*** No targets.");
            };
            targets.push(first_rule);
        }

        crate::log_stat!("{} variables", self.vars.len());
        crate::log_stat!("{} explicit rules", self.rules.len());
        crate::log_stat!("{} implicit rules", self.implicit_rules.len());
        crate::log_stat!("{} suffix rules", self.suffix_rules.len());

        let mut nodes = Vec::new();
        for target in targets {
            self.trace.clear();
            self.trace.push(target);
            let tsvs = Arc::new(Vars::new());
            let n = self.build_plan(target, None, &tsvs)?;
            nodes.push((target, n));
        }
        self.report_stats();
        Ok(nodes)
    }

    fn report_stats(&self) {
        if !FLAGS.enable_debug && !FLAGS.enable_stat_logs {
            return;
        }
        eprintln!(
            "*mkplan*: node={} explicit={} implicit={} suffix={} explicitWOCmd={}",
            self.stats.node_cnt,
            self.stats.pick_explicit_rule_cnt,
            self.stats.pick_implicit_rule_cnt,
            self.stats.pick_suffix_rule_cnt,
            self.stats.pick_explicit_rule_without_cmd_cnt
        );
        if self.trace.len() > 1 {
            eprintln!(
                "*mkplan*: trace={}",
                String::from_utf8_lossy(&join_symbols(&self.trace, b" "))
            );
        }
    }
}

/// Builds plan nodes for `targets`, or for the default goal when `targets`
/// is empty.
pub fn make_dep(
    er: EvalResult,
    vars: Arc<Vars>,
    paths: &PathCache,
    targets: Vec<Symbol>,
) -> Result<Vec<NamedDepNode>> {
    let mut db = DepBuilder::new(er, vars, paths)?;
    db.build(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pathutil::PathConfig;
    use crate::var::Variable;
    use std::path::Path;

    fn sym(s: &str) -> Symbol {
        intern(Bytes::copy_from_slice(s.as_bytes()))
    }

    fn r(outputs: &[&str], patterns: &[&str], inputs: &[&str], cmds: &[&str]) -> Rule {
        let mut rule = Rule::new(Loc::default(), false);
        rule.outputs = outputs.iter().map(|s| sym(s)).collect();
        rule.output_patterns = patterns.iter().map(|s| sym(s)).collect();
        rule.inputs = inputs.iter().map(|s| sym(s)).collect();
        rule.cmds = cmds
            .iter()
            .map(|s| Bytes::copy_from_slice(s.as_bytes()))
            .collect();
        rule
    }

    fn tsv(entries: &[(&str, &str, AssignOp)]) -> Arc<Vars> {
        let vars = Vars::new();
        for (name, value, op) in entries {
            vars.set(
                sym(name),
                Variable::new_target_specific(Bytes::copy_from_slice(value.as_bytes()), *op, None),
            );
        }
        Arc::new(vars)
    }

    fn plan(
        rules: Vec<Rule>,
        rule_vars: HashMap<Symbol, Arc<Vars>>,
        vars: Arc<Vars>,
        goals: &[&str],
    ) -> Result<Vec<NamedDepNode>> {
        let paths = PathCache::new(PathConfig::default());
        let er = EvalResult { rules, rule_vars };
        make_dep(er, vars, &paths, goals.iter().map(|g| sym(g)).collect())
    }

    fn touch(dir: &Path, name: &str) {
        std::fs::File::create(dir.join(name)).unwrap();
    }

    fn dep_names(n: &DepNode) -> Vec<String> {
        n.deps
            .iter()
            .map(|(s, _)| s.to_string())
            .collect::<Vec<_>>()
    }

    #[test]
    fn test_pattern_rule_with_target_specific_var() {
        let tmp = tempfile::tempdir().unwrap();
        let d = tmp.path().to_str().unwrap();
        touch(tmp.path(), "foo.c");
        let foo_o = format!("{d}/foo.o");
        let foo_c = format!("{d}/foo.c");

        let mut rule_vars = HashMap::new();
        rule_vars.insert(sym(&foo_o), tsv(&[("CFLAGS", "-O2", AssignOp::ColonEq)]));

        let nodes = plan(
            vec![r(&[], &["%.o"], &["%.c"], &["gcc $(CFLAGS) -c $<"])],
            rule_vars,
            Arc::new(Vars::new()),
            &[&foo_o],
        )
        .unwrap();
        assert_eq!(nodes.len(), 1);
        let n = nodes[0].1.lock();
        assert!(n.has_rule);
        assert_eq!(n.cmds, vec![Bytes::from_static(b"gcc $(CFLAGS) -c $<")]);
        assert_eq!(n.actual_inputs, vec![sym(&foo_c)]);
        let tsvs = n.target_specific_vars.as_ref().unwrap();
        assert_eq!(
            tsvs.lookup(sym("CFLAGS")).unwrap().read().string(),
            &Bytes::from_static(b"-O2")
        );

        assert_eq!(n.deps.len(), 1);
        let (child_name, child) = &n.deps[0];
        assert_eq!(*child_name, sym(&foo_c));
        let child = child.lock();
        assert!(!child.has_rule);
        assert!(child.cmds.is_empty());
        assert!(child.deps.is_empty());
    }

    #[test]
    fn test_suffix_rule() {
        let tmp = tempfile::tempdir().unwrap();
        let d = tmp.path().to_str().unwrap();
        touch(tmp.path(), "bar.c");
        let bar_o = format!("{d}/bar.o");
        let bar_c = format!("{d}/bar.c");

        let nodes = plan(
            vec![r(&[".c.o"], &[], &[], &["cc -c $<"])],
            HashMap::new(),
            Arc::new(Vars::new()),
            &[&bar_o],
        )
        .unwrap();
        let n = nodes[0].1.lock();
        assert!(n.has_rule);
        assert_eq!(n.cmds, vec![Bytes::from_static(b"cc -c $<")]);
        assert_eq!(n.actual_inputs, vec![sym(&bar_c)]);
        assert_eq!(dep_names(&n), vec![bar_c]);
    }

    #[test]
    fn test_commandless_explicit_wrapped_by_implicit() {
        let tmp = tempfile::tempdir().unwrap();
        let d = tmp.path().to_str().unwrap();
        touch(tmp.path(), "foo.c");
        touch(tmp.path(), "extra.h");
        let foo_o = format!("{d}/foo.o");
        let foo_c = format!("{d}/foo.c");
        let extra_h = format!("{d}/extra.h");

        let nodes = plan(
            vec![
                r(&[&foo_o], &[], &[&extra_h], &[]),
                r(&[], &["%.o"], &["%.c"], &["cc -c $<"]),
            ],
            HashMap::new(),
            Arc::new(Vars::new()),
            &[&foo_o],
        )
        .unwrap();
        let n = nodes[0].1.lock();
        // The implicit rule's input was prepended, so it supplies $<.
        assert_eq!(dep_names(&n), vec![foo_c, extra_h]);
        assert_eq!(n.cmds, vec![Bytes::from_static(b"cc -c $<")]);
    }

    #[test]
    fn test_double_colon_accumulates_commands() {
        let mut r1 = r(&["all"], &[], &[], &["echo A"]);
        r1.is_double_colon = true;
        let mut r2 = r(&["all"], &[], &[], &["echo B"]);
        r2.is_double_colon = true;

        // Empty goal list resolves to the default goal.
        let nodes = plan(vec![r1, r2], HashMap::new(), Arc::new(Vars::new()), &[]).unwrap();
        assert_eq!(nodes[0].0, sym("all"));
        let n = nodes[0].1.lock();
        assert_eq!(
            n.cmds,
            vec![Bytes::from_static(b"echo A"), Bytes::from_static(b"echo B")]
        );
    }

    #[test]
    fn test_order_only_inputs() {
        let mut rule = r(&["a"], &[], &["b"], &["run"]);
        rule.order_only_inputs = vec![sym("c")];

        let nodes = plan(vec![rule], HashMap::new(), Arc::new(Vars::new()), &["a"]).unwrap();
        let n = nodes[0].1.lock();
        assert_eq!(dep_names(&n), vec!["b", "c"]);
        assert!(!n.deps[0].1.lock().is_order_only);
        assert!(n.deps[1].1.lock().is_order_only);
        // $^ expands against regular inputs only.
        assert_eq!(n.actual_inputs, vec![sym("b")]);
    }

    #[test]
    fn test_order_only_does_not_downgrade_first_reference() {
        // c is first reached as a regular prerequisite; the later
        // order-only edge from p2 must not flip it.
        let mut p2 = r(&["p2"], &[], &[], &["x"]);
        p2.order_only_inputs = vec![sym("c")];
        let nodes = plan(
            vec![
                r(&["top"], &[], &["p1", "p2"], &["t"]),
                r(&["p1"], &[], &["c"], &["x"]),
                p2,
            ],
            HashMap::new(),
            Arc::new(Vars::new()),
            &["top"],
        )
        .unwrap();
        let top = nodes[0].1.lock();
        let p1 = top.deps[0].1.lock();
        assert!(!p1.deps[0].1.lock().is_order_only);
        let p2 = top.deps[1].1.lock();
        assert!(!p2.deps[0].1.lock().is_order_only);
    }

    #[test]
    fn test_shared_child_is_memoised() {
        let nodes = plan(
            vec![
                r(&["x"], &[], &["y", "z"], &["r"]),
                r(&["y"], &[], &["z"], &["s"]),
                r(&["z"], &[], &[], &["t"]),
            ],
            HashMap::new(),
            Arc::new(Vars::new()),
            &["x"],
        )
        .unwrap();
        let x = nodes[0].1.lock();
        assert_eq!(dep_names(&x), vec!["y", "z"]);
        let y = x.deps[0].1.clone();
        let z_from_x = x.deps[1].1.clone();
        let z_from_y = y.lock().deps[0].1.clone();
        assert!(Arc::ptr_eq(&z_from_x, &z_from_y));
    }

    #[test]
    fn test_explicit_with_commands_beats_implicit() {
        let tmp = tempfile::tempdir().unwrap();
        let d = tmp.path().to_str().unwrap();
        touch(tmp.path(), "foo.c");
        let foo_o = format!("{d}/foo.o");

        let paths = PathCache::new(PathConfig::default());
        let er = EvalResult {
            rules: vec![
                r(&[&foo_o], &[], &[], &["explicit"]),
                r(&[], &["%.o"], &["%.c"], &["implicit"]),
            ],
            rule_vars: HashMap::new(),
        };
        let mut db = DepBuilder::new(er, Arc::new(Vars::new()), &paths).unwrap();
        let nodes = db.build(vec![sym(&foo_o)]).unwrap();
        assert_eq!(
            nodes[0].1.lock().cmds,
            vec![Bytes::from_static(b"explicit")]
        );
        assert_eq!(db.stats().pick_explicit_rule_cnt, 1);
        assert_eq!(db.stats().pick_implicit_rule_cnt, 0);
    }

    #[test]
    fn test_later_implicit_rule_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let d = tmp.path().to_str().unwrap();
        touch(tmp.path(), "foo.c");
        let foo_o = format!("{d}/foo.o");

        let nodes = plan(
            vec![
                r(&[], &["%.o"], &["%.c"], &["first"]),
                r(&[], &["%.o"], &["%.c"], &["second"]),
            ],
            HashMap::new(),
            Arc::new(Vars::new()),
            &[&foo_o],
        )
        .unwrap();
        assert_eq!(nodes[0].1.lock().cmds, vec![Bytes::from_static(b"second")]);
    }

    #[test]
    fn test_implicit_rule_requires_existing_inputs() {
        let tmp = tempfile::tempdir().unwrap();
        let d = tmp.path().to_str().unwrap();
        let foo_o = format!("{d}/foo.o");

        // No foo.c anywhere, so the pattern rule is not applicable.
        let nodes = plan(
            vec![r(&[], &["%.o"], &["%.c"], &["cc -c $<"])],
            HashMap::new(),
            Arc::new(Vars::new()),
            &[&foo_o],
        )
        .unwrap();
        let n = nodes[0].1.lock();
        assert!(!n.has_rule);
        assert!(n.cmds.is_empty());
        assert!(n.deps.is_empty());
    }

    #[test]
    fn test_phony_input_satisfies_existence() {
        let nodes = plan(
            vec![
                r(&[".PHONY"], &[], &["gen"], &[]),
                r(&[], &["%.out"], &["gen"], &["make-it"]),
            ],
            HashMap::new(),
            Arc::new(Vars::new()),
            &["x.out"],
        )
        .unwrap();
        let n = nodes[0].1.lock();
        assert!(n.has_rule);
        assert_eq!(n.cmds, vec![Bytes::from_static(b"make-it")]);
    }

    #[test]
    fn test_merge_new_commands_put_new_inputs_first() {
        let nodes = plan(
            vec![
                r(&["t"], &[], &["a"], &[]),
                r(&["t"], &[], &["b"], &["cmd"]),
            ],
            HashMap::new(),
            Arc::new(Vars::new()),
            &["t"],
        )
        .unwrap();
        let n = nodes[0].1.lock();
        assert_eq!(n.actual_inputs, vec![sym("b"), sym("a")]);
        assert_eq!(n.cmds, vec![Bytes::from_static(b"cmd")]);
    }

    #[test]
    fn test_merge_commandless_redefinition_keeps_old_commands() {
        let nodes = plan(
            vec![
                r(&["t"], &[], &["a"], &["cmd"]),
                r(&["t"], &[], &["b"], &[]),
            ],
            HashMap::new(),
            Arc::new(Vars::new()),
            &["t"],
        )
        .unwrap();
        let n = nodes[0].1.lock();
        assert_eq!(n.actual_inputs, vec![sym("a"), sym("b")]);
        assert_eq!(n.cmds, vec![Bytes::from_static(b"cmd")]);
    }

    #[test]
    fn test_mixed_colon_kinds_rejected() {
        let mut r2 = r(&["t"], &[], &[], &["y"]);
        r2.is_double_colon = true;
        let err = plan(
            vec![r(&["t"], &[], &[], &["x"]), r2],
            HashMap::new(),
            Arc::new(Vars::new()),
            &["t"],
        )
        .unwrap_err();
        assert!(err.to_string().contains("has both : and :: entries"));
    }

    #[test]
    fn test_no_targets() {
        let err = plan(vec![], HashMap::new(), Arc::new(Vars::new()), &[]).unwrap_err();
        assert!(err.to_string().contains("No targets"));
    }

    #[test]
    fn test_default_goal_skips_dot_targets() {
        let nodes = plan(
            vec![
                r(&[".special"], &[], &[], &["s"]),
                r(&["all"], &[], &[], &["a"]),
            ],
            HashMap::new(),
            Arc::new(Vars::new()),
            &[],
        )
        .unwrap();
        assert_eq!(nodes[0].0, sym("all"));
    }

    #[test]
    fn test_multiple_output_patterns_rejected() {
        let err = plan(
            vec![r(&["t"], &["%.a", "%.b"], &["x"], &["cmd"])],
            HashMap::new(),
            Arc::new(Vars::new()),
            &["t"],
        )
        .unwrap_err();
        assert!(
            err.to_string()
                .contains("multiple output patterns are not supported")
        );
    }

    #[test]
    fn test_target_specific_vars_propagate_and_restore() {
        let vars = Arc::new(Vars::new());
        vars.set(
            sym("CFLAGS"),
            Variable::with_simple_string(Bytes::from_static(b"-g"), None),
        );

        let mut rule_vars = HashMap::new();
        rule_vars.insert(sym("x"), tsv(&[("CFLAGS", "-O2", AssignOp::PlusEq)]));
        rule_vars.insert(sym("y"), tsv(&[("DEBUG", "1", AssignOp::QuestionEq)]));

        let nodes = plan(
            vec![r(&["x"], &[], &["y"], &["cx"]), r(&["y"], &[], &[], &["cy"])],
            rule_vars,
            vars.clone(),
            &["x"],
        )
        .unwrap();
        let x = nodes[0].1.lock();
        let x_tsvs = x.target_specific_vars.as_ref().unwrap();
        assert_eq!(
            x_tsvs.lookup(sym("CFLAGS")).unwrap().read().string(),
            &Bytes::from_static(b"-g -O2")
        );

        // y inherits the += result and adds its own ?= binding.
        let y = x.deps[0].1.lock();
        let y_tsvs = y.target_specific_vars.as_ref().unwrap();
        assert_eq!(
            y_tsvs.lookup(sym("CFLAGS")).unwrap().read().string(),
            &Bytes::from_static(b"-g -O2")
        );
        assert_eq!(
            y_tsvs.lookup(sym("DEBUG")).unwrap().read().string(),
            &Bytes::from_static(b"1")
        );

        // The global table is back to its pre-plan state.
        assert_eq!(
            vars.lookup(sym("CFLAGS")).unwrap().read().string(),
            &Bytes::from_static(b"-g")
        );
        assert!(vars.lookup(sym("DEBUG")).is_none());
    }

    #[test]
    fn test_conditional_assignment_skipped_when_global_set() {
        let vars = Arc::new(Vars::new());
        vars.set(
            sym("OPT"),
            Variable::with_simple_string(Bytes::from_static(b"0"), None),
        );
        let mut rule_vars = HashMap::new();
        rule_vars.insert(sym("t"), tsv(&[("OPT", "1", AssignOp::QuestionEq)]));

        let nodes = plan(
            vec![r(&["t"], &[], &[], &["c"])],
            rule_vars,
            vars.clone(),
            &["t"],
        )
        .unwrap();
        let n = nodes[0].1.lock();
        // ?= did not fire, so the snapshot has no binding for OPT.
        assert!(
            n.target_specific_vars
                .as_ref()
                .unwrap()
                .lookup(sym("OPT"))
                .is_none()
        );
        assert_eq!(
            vars.lookup(sym("OPT")).unwrap().read().string(),
            &Bytes::from_static(b"0")
        );
    }

    #[test]
    fn test_unrelated_subtree_does_not_see_sibling_vars() {
        let mut rule_vars = HashMap::new();
        rule_vars.insert(sym("a"), tsv(&[("V", "a-only", AssignOp::ColonEq)]));

        let nodes = plan(
            vec![
                r(&["top"], &[], &["a", "b"], &["t"]),
                r(&["a"], &[], &[], &["ca"]),
                r(&["b"], &[], &[], &["cb"]),
            ],
            rule_vars,
            Arc::new(Vars::new()),
            &["top"],
        )
        .unwrap();
        let top = nodes[0].1.lock();
        let a = top.deps[0].1.lock();
        let b = top.deps[1].1.lock();
        assert!(
            a.target_specific_vars
                .as_ref()
                .unwrap()
                .lookup(sym("V"))
                .is_some()
        );
        assert!(
            b.target_specific_vars
                .as_ref()
                .unwrap()
                .lookup(sym("V"))
                .is_none()
        );
    }

    #[test]
    fn test_implicit_rule_vars_are_overridden_by_target_vars() {
        let tmp = tempfile::tempdir().unwrap();
        let d = tmp.path().to_str().unwrap();
        touch(tmp.path(), "foo.c");
        let foo_o = format!("{d}/foo.o");

        let mut rule_vars = HashMap::new();
        rule_vars.insert(
            sym(&foo_o),
            tsv(&[("CFLAGS", "-target", AssignOp::ColonEq)]),
        );
        rule_vars.insert(
            sym("%.o"),
            tsv(&[
                ("CFLAGS", "-pattern", AssignOp::ColonEq),
                ("EXTRA", "-e", AssignOp::ColonEq),
            ]),
        );

        let nodes = plan(
            vec![r(&[], &["%.o"], &["%.c"], &["cc"])],
            rule_vars,
            Arc::new(Vars::new()),
            &[&foo_o],
        )
        .unwrap();
        let n = nodes[0].1.lock();
        let tsvs = n.target_specific_vars.as_ref().unwrap();
        assert_eq!(
            tsvs.lookup(sym("CFLAGS")).unwrap().read().string(),
            &Bytes::from_static(b"-target")
        );
        assert_eq!(
            tsvs.lookup(sym("EXTRA")).unwrap().read().string(),
            &Bytes::from_static(b"-e")
        );
    }

    #[test]
    fn test_suffix_rule_most_recent_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let d = tmp.path().to_str().unwrap();
        touch(tmp.path(), "baz.c");
        let baz_o = format!("{d}/baz.o");

        let nodes = plan(
            vec![
                r(&[".c.o"], &[], &[], &["old"]),
                r(&[".c.o"], &[], &[], &["new"]),
            ],
            HashMap::new(),
            Arc::new(Vars::new()),
            &[&baz_o],
        )
        .unwrap();
        assert_eq!(nodes[0].1.lock().cmds, vec![Bytes::from_static(b"new")]);
    }

    #[test]
    fn test_suffix_rule_needs_existing_source() {
        let tmp = tempfile::tempdir().unwrap();
        let d = tmp.path().to_str().unwrap();
        let qux_o = format!("{d}/qux.o");

        let nodes = plan(
            vec![r(&[".c.o"], &[], &[], &["cc -c $<"])],
            HashMap::new(),
            Arc::new(Vars::new()),
            &[&qux_o],
        )
        .unwrap();
        assert!(!nodes[0].1.lock().has_rule);
    }

    #[test]
    fn test_suffix_shape_detection() {
        assert!(is_suffix_rule_shape(b".c.o"));
        assert!(!is_suffix_rule_shape(b"foo"));
        assert!(!is_suffix_rule_shape(b".co"));
        assert!(!is_suffix_rule_shape(b".c.o.b"));
    }

    #[test]
    fn test_inputs_are_path_cleaned() {
        let nodes = plan(
            vec![r(&["t"], &[], &["./dir/../a.c", "b//c.c"], &["cmd"])],
            HashMap::new(),
            Arc::new(Vars::new()),
            &["t"],
        )
        .unwrap();
        let n = nodes[0].1.lock();
        assert_eq!(n.actual_inputs, vec![sym("a.c"), sym("b/c.c")]);
    }

    #[test]
    fn test_selection_stats() {
        let tmp = tempfile::tempdir().unwrap();
        let d = tmp.path().to_str().unwrap();
        touch(tmp.path(), "foo.c");
        touch(tmp.path(), "extra.h");
        let foo_o = format!("{d}/foo.o");
        let extra_h = format!("{d}/extra.h");

        let paths = PathCache::new(PathConfig::default());
        let er = EvalResult {
            rules: vec![
                r(&[&foo_o], &[], &[&extra_h], &[]),
                r(&[], &["%.o"], &["%.c"], &["cc -c $<"]),
            ],
            rule_vars: HashMap::new(),
        };
        let mut db = DepBuilder::new(er, Arc::new(Vars::new()), &paths).unwrap();
        db.build(vec![sym(&foo_o)]).unwrap();
        let stats = db.stats();
        assert_eq!(stats.node_cnt, 3);
        assert_eq!(stats.pick_explicit_rule_cnt, 1);
        assert_eq!(stats.pick_explicit_rule_without_cmd_cnt, 1);
        assert_eq!(stats.pick_implicit_rule_cnt, 1);
        assert_eq!(stats.pick_suffix_rule_cnt, 0);
    }
}
