//! Combinator-based pattern matching over the instruction graph.
//!
//! A [`Matcher`] is a predicate over one instruction that may record named
//! [`Bindings`] as it walks the graph. Rules are matched candidate by
//! candidate in topological order; the first rule whose matcher accepts a
//! candidate gets to rewrite it and no later rule is tried on it.

use std::{collections::HashMap, rc::Rc};

use tracing::{debug, trace};

use crate::graph::{
    instruction::InsId,
    operator::OpKind,
    GraphError, Module,
};

/// Names bound to instructions during a match.
pub type Bindings = HashMap<&'static str, InsId>;

#[derive(Clone)]
pub struct Matcher(Rc<dyn Fn(&Module, InsId, &mut Bindings) -> bool>);

impl Matcher {
    pub fn new(f: impl Fn(&Module, InsId, &mut Bindings) -> bool + 'static) -> Self {
        Self(Rc::new(f))
    }

    pub fn matches(&self, graph: &Module, ins: InsId, bindings: &mut Bindings) -> bool {
        (self.0)(graph, ins, bindings)
    }

    /// Records the matched instruction under `name`. Binding the same name
    /// to two different instructions fails the match.
    pub fn bind(self, name: &'static str) -> Self {
        Self::new(move |graph, ins, bindings| {
            if !self.matches(graph, ins, bindings) {
                return false;
            }
            match bindings.get(name) {
                Some(&bound) if bound != ins => false,
                _ => {
                    bindings.insert(name, ins);
                    true
                }
            }
        })
    }
}

/// Matches every instruction.
pub fn any() -> Matcher {
    Matcher::new(|_, _, _| true)
}

/// Matches instructions whose operator kind is in `kinds`.
pub fn name(kinds: &'static [OpKind]) -> Matcher {
    Matcher::new(move |graph, ins, _| {
        graph.get(ins).map(|i| kinds.contains(&i.kind())).unwrap_or(false)
    })
}

pub fn nargs(n: usize) -> Matcher {
    Matcher::new(move |graph, ins, _| graph.get(ins).map(|i| i.inputs().len() == n).unwrap_or(false))
}

pub fn pointwise() -> Matcher {
    Matcher::new(|graph, ins, _| graph.get(ins).map(|i| i.op().is_pointwise()).unwrap_or(false))
}

pub fn used_once() -> Matcher {
    Matcher::new(|graph, ins, _| graph.get(ins).map(|i| i.used_once()).unwrap_or(false))
}

pub fn standard_shape() -> Matcher {
    Matcher::new(|graph, ins, _| graph.get(ins).map(|i| i.shape().is_standard()).unwrap_or(false))
}

pub fn transposed_shape() -> Matcher {
    Matcher::new(|graph, ins, _| graph.get(ins).map(|i| i.shape().is_transposed()).unwrap_or(false))
}

/// Matches when the instruction's shape equals the shape of its `i`-th input.
pub fn same_shape_as_arg(i: usize) -> Matcher {
    Matcher::new(move |graph, ins, _| {
        let Ok(node) = graph.get(ins) else { return false };
        let Some(&input) = node.inputs().get(i) else { return false };
        graph.shape_of(input).map(|s| s == node.shape()).unwrap_or(false)
    })
}

/// Matches when the instruction has no parameter among its transitive inputs.
pub fn is_constant() -> Matcher {
    Matcher::new(|graph, ins, _| {
        let mut stack = vec![ins];
        let mut seen = std::collections::HashSet::new();
        while let Some(id) = stack.pop() {
            let Ok(node) = graph.get(id) else { return false };
            if node.kind() == OpKind::Param {
                return false;
            }
            if seen.insert(id) {
                stack.extend_from_slice(node.inputs());
            }
        }
        true
    })
}

/// All sub-matchers must accept the instruction.
pub fn all_of(matchers: Vec<Matcher>) -> Matcher {
    Matcher::new(move |graph, ins, bindings| matchers.iter().all(|m| m.matches(graph, ins, bindings)))
}

/// At least one sub-matcher accepts; bindings from failed alternatives are
/// rolled back.
pub fn any_of(matchers: Vec<Matcher>) -> Matcher {
    Matcher::new(move |graph, ins, bindings| {
        for m in &matchers {
            let mut attempt = bindings.clone();
            if m.matches(graph, ins, &mut attempt) {
                *bindings = attempt;
                return true;
            }
        }
        false
    })
}

/// No sub-matcher accepts; never contributes bindings.
pub fn none_of(matchers: Vec<Matcher>) -> Matcher {
    Matcher::new(move |graph, ins, bindings| {
        !matchers.iter().any(|m| m.matches(graph, ins, &mut bindings.clone()))
    })
}

/// The instruction has exactly `matchers.len()` inputs and each input
/// matches the corresponding sub-matcher.
pub fn args(matchers: Vec<Matcher>) -> Matcher {
    Matcher::new(move |graph, ins, bindings| {
        let Ok(node) = graph.get(ins) else { return false };
        if node.inputs().len() != matchers.len() {
            return false;
        }
        let inputs = node.inputs().to_vec();
        inputs.iter().zip(&matchers).all(|(&input, m)| m.matches(graph, input, bindings))
    })
}

/// The `i`-th input exists and matches.
pub fn arg(i: usize, matcher: Matcher) -> Matcher {
    Matcher::new(move |graph, ins, bindings| {
        let Ok(node) = graph.get(ins) else { return false };
        let Some(&input) = node.inputs().get(i) else { return false };
        matcher.matches(graph, input, bindings)
    })
}

/// Binary-argument matcher that tries both operand orders, rolling back
/// bindings between attempts.
pub fn either_arg(i: usize, j: usize, a: Matcher, b: Matcher) -> Matcher {
    any_of(vec![
        all_of(vec![arg(i, a.clone()), arg(j, b.clone())]),
        all_of(vec![arg(j, a), arg(i, b)]),
    ])
}

/// Some input matches; stops at the first success.
pub fn any_of_inputs(matcher: Matcher) -> Matcher {
    Matcher::new(move |graph, ins, bindings| {
        let Ok(node) = graph.get(ins) else { return false };
        let inputs = node.inputs().to_vec();
        for input in inputs {
            let mut attempt = bindings.clone();
            if matcher.matches(graph, input, &mut attempt) {
                *bindings = attempt;
                return true;
            }
        }
        false
    })
}

/// Every input matches; the instruction must have at least one.
pub fn all_of_inputs(matcher: Matcher) -> Matcher {
    Matcher::new(move |graph, ins, bindings| {
        let Ok(node) = graph.get(ins) else { return false };
        if node.inputs().is_empty() {
            return false;
        }
        let inputs = node.inputs().to_vec();
        inputs.iter().all(|&input| matcher.matches(graph, input, bindings))
    })
}

/// Some consumer matches; stops at the first success.
pub fn any_of_outputs(matcher: Matcher) -> Matcher {
    Matcher::new(move |graph, ins, bindings| {
        let Ok(node) = graph.get(ins) else { return false };
        let outputs = node.outputs().to_vec();
        for output in outputs {
            let mut attempt = bindings.clone();
            if matcher.matches(graph, output, &mut attempt) {
                *bindings = attempt;
                return true;
            }
        }
        false
    })
}

/// Every consumer matches (vacuously true with no consumers).
pub fn all_of_outputs(matcher: Matcher) -> Matcher {
    Matcher::new(move |graph, ins, bindings| {
        let Ok(node) = graph.get(ins) else { return false };
        let outputs = node.outputs().to_vec();
        outputs.iter().all(|&output| matcher.matches(graph, output, bindings))
    })
}

/// No consumer matches; never contributes bindings.
pub fn none_of_outputs(matcher: Matcher) -> Matcher {
    Matcher::new(move |graph, ins, bindings| {
        let Ok(node) = graph.get(ins) else { return false };
        !node.outputs().iter().any(|&output| matcher.matches(graph, output, &mut bindings.clone()))
    })
}

/// The instruction has exactly one consumer and it matches.
pub fn output(matcher: Matcher) -> Matcher {
    Matcher::new(move |graph, ins, bindings| {
        let Ok(node) = graph.get(ins) else { return false };
        match node.outputs() {
            &[only] => matcher.matches(graph, only, bindings),
            _ => false,
        }
    })
}

/// Walks down through single-input instructions of the given kinds (starting
/// at the candidate itself) and applies the matcher to where it lands.
pub fn skip(kinds: &'static [OpKind], matcher: Matcher) -> Matcher {
    Matcher::new(move |graph, ins, bindings| {
        let mut current = ins;
        loop {
            let Ok(node) = graph.get(current) else { return false };
            if kinds.contains(&node.kind()) && node.inputs().len() == 1 {
                current = node.inputs()[0];
            } else {
                return matcher.matches(graph, current, bindings);
            }
        }
    })
}

/// Walks up through consumers of the given kinds, testing every reachable
/// consumer against the matcher.
pub fn skip_outputs(kinds: &'static [OpKind], matcher: Matcher) -> Matcher {
    Matcher::new(move |graph, ins, bindings| {
        let Ok(node) = graph.get(ins) else { return false };
        let mut pending = node.outputs().to_vec();
        let mut seen = std::collections::HashSet::new();
        while let Some(id) = pending.pop() {
            if !seen.insert(id) {
                continue;
            }
            let mut attempt = bindings.clone();
            if matcher.matches(graph, id, &mut attempt) {
                *bindings = attempt;
                return true;
            }
            let Ok(consumer) = graph.get(id) else { return false };
            if kinds.contains(&consumer.kind()) {
                pending.extend_from_slice(consumer.outputs());
            }
        }
        false
    })
}

/// A successful match: the candidate instruction plus everything the matcher
/// bound along the way.
pub struct MatchResult {
    pub root: InsId,
    bindings: Bindings,
}

impl MatchResult {
    pub fn new(root: InsId, bindings: Bindings) -> Self {
        Self { root, bindings }
    }

    /// Looks up a name the matcher bound. Asking for an unbound name is a
    /// bug in the rule, not a runtime condition.
    pub fn get(&self, name: &str) -> InsId {
        *self.bindings.get(name).unwrap_or_else(|| panic!("nothing bound to '{name}'"))
    }
}

/// A rewrite rule: a pattern and an action. `apply` returns whether it
/// mutated the graph; returning [`GraphError::ShapeInference`] or `Ok(false)`
/// declines the rewrite without aborting the pass.
pub trait Rule {
    fn name(&self) -> &'static str;

    fn matcher(&self) -> Matcher;

    fn apply(&self, graph: &mut Module, result: &MatchResult) -> Result<bool, GraphError>;
}

/// Scans a topological snapshot of the graph, trying the rules in order on
/// each instruction. The first rule to match a candidate claims it. Returns
/// how many rewrites actually changed the graph.
pub fn find_matches(graph: &mut Module, rules: &[Box<dyn Rule>]) -> Result<usize, GraphError> {
    let order = graph.topo_order()?;
    let mut applied = 0;

    for ins in order {
        if !graph.contains(ins) {
            continue;
        }
        for rule in rules {
            let mut bindings = Bindings::new();
            if !rule.matcher().matches(graph, ins, &mut bindings) {
                continue;
            }
            let result = MatchResult::new(ins, bindings);
            match rule.apply(graph, &result) {
                Ok(true) => {
                    debug!(rule = rule.name(), root = ?ins, "applied rewrite");
                    applied += 1;
                }
                Ok(false) => {
                    trace!(rule = rule.name(), root = ?ins, "rewrite declined");
                }
                Err(GraphError::ShapeInference(msg)) => {
                    trace!(rule = rule.name(), root = ?ins, %msg, "rewrite declined");
                }
                Err(e) => return Err(e),
            }
            break;
        }
    }

    Ok(applied)
}
