use crate::{
    graph::{
        operator::{Op, OpKind},
        GraphError, Module,
    },
    matcher::{arg, all_of, name, MatchResult, Matcher, Rule},
};

/// Drops the intermediate step of a convert-of-convert when the outer
/// convert lands back on the original type.
pub struct ElideNestedConverts;

impl Rule for ElideNestedConverts {
    fn name(&self) -> &'static str {
        "elide-nested-converts"
    }

    fn matcher(&self) -> Matcher {
        all_of(vec![name(&[OpKind::Convert]), arg(0, name(&[OpKind::Convert]).bind("inner"))])
    }

    fn apply(&self, graph: &mut Module, result: &MatchResult) -> Result<bool, GraphError> {
        let ins = result.root;
        let base = graph.get(result.get("inner"))?.inputs()[0];
        if graph.shape_of(base)? != graph.shape_of(ins)? {
            return Ok(false);
        }
        graph.replace_instruction(ins, base)?;
        Ok(true)
    }
}
