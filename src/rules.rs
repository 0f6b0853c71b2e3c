//! Rewrite rules over the reshape/transpose/slice/concat/broadcast algebra.
//!
//! Each rule is a [`Rule`](crate::matcher::Rule) pairing a matcher with an
//! action. Rules only ever replace an instruction with a value-equal one;
//! a rule that cannot prove its preconditions declines and leaves the graph
//! untouched.

mod concat;
mod convert;
mod gather;
mod reshape;
mod slice;
mod transpose;

pub use concat::{FlattenNestedConcats, HoistConcatMultibroadcasts, HoistConcatTransposes};
pub use convert::ElideNestedConverts;
pub use gather::{RecognizeConstWhere, RecognizeResize};
pub use reshape::{
    CollapseReshapes, HoistUnaryAboveContiguousReshape, PushReshapeThroughPointwise, RemoveNoops,
};
pub use slice::MergeNestedSlices;
pub use transpose::{FoldTransposeChains, HoistSliceTransposes, SplitTransposeSlices};

use crate::{
    graph::{instruction::InsId, operator::Op, GraphError, Module},
    matcher::Rule,
};

/// Swaps an instruction for a value-equal one, appending a contiguous copy
/// when the replacement's layout differs from the original's.
pub(crate) fn replace_packed(graph: &mut Module, old: InsId, new: InsId) -> Result<(), GraphError> {
    let new = if graph.shape_of(old)? == graph.shape_of(new)? {
        new
    } else {
        graph.insert_instruction(Op::Contiguous, [new])?
    };
    graph.replace_instruction(old, new)
}

/// The full rule set in dispatch order. Earlier rules win ties, so the
/// structural recognisers come before the generic cleanups.
pub fn all_rules() -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(RecognizeConstWhere),
        Box::new(RecognizeResize),
        Box::new(RemoveNoops),
        Box::new(CollapseReshapes),
        Box::new(PushReshapeThroughPointwise),
        Box::new(FoldTransposeChains),
        Box::new(HoistConcatTransposes),
        Box::new(HoistConcatMultibroadcasts),
        Box::new(ElideNestedConverts),
        Box::new(MergeNestedSlices),
        Box::new(FlattenNestedConcats),
        Box::new(SplitTransposeSlices),
        Box::new(HoistSliceTransposes),
        Box::new(HoistUnaryAboveContiguousReshape),
    ]
}
