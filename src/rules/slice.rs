use std::collections::BTreeMap;

use crate::{
    graph::{
        operator::{Op, OpKind},
        GraphError, Module,
    },
    matcher::{arg, all_of, name, MatchResult, Matcher, Rule},
};

/// Merges a slice of a slice into one slice in the coordinates of the
/// original tensor. Axes sliced by both are intersected: the outer range is
/// shifted by the inner start.
pub struct MergeNestedSlices;

impl Rule for MergeNestedSlices {
    fn name(&self) -> &'static str {
        "merge-nested-slices"
    }

    fn matcher(&self) -> Matcher {
        all_of(vec![name(&[OpKind::Slice]), arg(0, name(&[OpKind::Slice]).bind("inner"))])
    }

    fn apply(&self, graph: &mut Module, result: &MatchResult) -> Result<bool, GraphError> {
        let outer = result.root;
        let inner = result.get("inner");

        let Op::Slice { axes, starts, ends } = graph.get(outer)?.op().clone() else {
            return Ok(false);
        };
        let mut ranges: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
        for ((&axis, &start), &end) in axes.iter().zip(&starts).zip(&ends) {
            ranges.insert(axis, (start, end));
        }

        let Op::Slice { axes, starts, ends } = graph.get(inner)?.op().clone() else {
            return Ok(false);
        };
        for ((&axis, &start), &end) in axes.iter().zip(&starts).zip(&ends) {
            match ranges.get_mut(&axis) {
                Some(range) => {
                    // shift the outer window into the base coordinates
                    let merged_start = start + range.0;
                    *range = (merged_start, merged_start + (range.1 - range.0));
                }
                None => {
                    ranges.insert(axis, (start, end));
                }
            }
        }

        let merged = Op::Slice {
            axes: ranges.keys().copied().collect(),
            starts: ranges.values().map(|r| r.0).collect(),
            ends: ranges.values().map(|r| r.1).collect(),
        };
        let base = graph.get(inner)?.inputs()[0];
        graph.replace_with(outer, merged, [base])?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        matcher::find_matches,
        shape::{DType, Shape},
    };

    #[test]
    fn merges_overlapping_slice_ranges() -> Result<(), GraphError> {
        let mut graph = Module::new();
        let x = graph.add_parameter("x", Shape::standard(DType::F32, [16]));
        let inner = graph.insert_instruction(
            Op::Slice { axes: vec![0], starts: vec![1], ends: vec![10] },
            [x],
        )?;
        let outer = graph.insert_instruction(
            Op::Slice { axes: vec![0], starts: vec![2], ends: vec![8] },
            [inner],
        )?;
        graph.add_return(outer)?;

        let rules: Vec<Box<dyn Rule>> = vec![Box::new(MergeNestedSlices)];
        assert_eq!(find_matches(&mut graph, &rules)?, 1);
        graph.eliminate_dead_code()?;
        graph.check_valid()?;

        let ret = graph.returns()[0];
        assert_eq!(
            graph.get(ret)?.op(),
            &Op::Slice { axes: vec![0], starts: vec![3], ends: vec![9] }
        );
        assert_eq!(graph.get(ret)?.inputs(), [x]);
        assert_eq!(graph.num_instructions(), 2);
        Ok(())
    }

    #[test]
    fn merges_disjoint_axes() -> Result<(), GraphError> {
        let mut graph = Module::new();
        let x = graph.add_parameter("x", Shape::standard(DType::F32, [8, 8]));
        let inner = graph.insert_instruction(
            Op::Slice { axes: vec![1], starts: vec![2], ends: vec![6] },
            [x],
        )?;
        let outer = graph.insert_instruction(
            Op::Slice { axes: vec![0], starts: vec![1], ends: vec![5] },
            [inner],
        )?;
        graph.add_return(outer)?;

        let rules: Vec<Box<dyn Rule>> = vec![Box::new(MergeNestedSlices)];
        assert_eq!(find_matches(&mut graph, &rules)?, 1);
        graph.eliminate_dead_code()?;
        graph.check_valid()?;

        let ret = graph.returns()[0];
        assert_eq!(
            graph.get(ret)?.op(),
            &Op::Slice { axes: vec![0, 1], starts: vec![1, 2], ends: vec![5, 6] }
        );
        assert_eq!(graph.shape_of(ret)?.lens(), [4, 4]);
        Ok(())
    }
}
