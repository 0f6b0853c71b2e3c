use std::collections::BTreeMap;

use crate::{
    graph::{
        instruction::InsId,
        operator::{Op, OpKind},
        GraphError, Module,
    },
    matcher::{
        all_of, all_of_outputs, any_of_outputs, args, name, none_of, output, skip, skip_outputs,
        MatchResult, Matcher, Rule,
    },
    shape::{invert_permutation, is_identity_permutation},
};

/// The nearest transpose feeding `ins` through a chain of contiguous
/// instructions, or `ins` itself if there is none.
fn find_transpose_input(graph: &Module, ins: InsId) -> Result<InsId, GraphError> {
    let mut current = ins;
    loop {
        let node = graph.get(current)?;
        if node.inputs().len() != 1 {
            return Ok(ins);
        }
        let next = node.inputs()[0];
        match graph.get(next)?.kind() {
            OpKind::Contiguous => current = next,
            OpKind::Transpose => return Ok(next),
            _ => return Ok(ins),
        }
    }
}

/// Folds a chain of transposes (possibly separated by contiguous copies)
/// into one transpose with the composed permutation, or into nothing when
/// the composition is the identity.
pub struct FoldTransposeChains;

impl Rule for FoldTransposeChains {
    fn name(&self) -> &'static str {
        "fold-transpose-chains"
    }

    fn matcher(&self) -> Matcher {
        all_of(vec![
            name(&[OpKind::Transpose]),
            // only fire at the end of the chain
            none_of(vec![skip_outputs(&[OpKind::Contiguous], name(&[OpKind::Transpose]))]),
            args(vec![skip(&[OpKind::Contiguous], name(&[OpKind::Transpose]))]),
        ])
    }

    fn apply(&self, graph: &mut Module, result: &MatchResult) -> Result<bool, GraphError> {
        let ins = result.root;
        let rank = graph.shape_of(ins)?.rank();
        let mut dims: Vec<usize> = (0..rank).collect();
        let (mut x, mut t) = (ins, ins);

        loop {
            let Op::Transpose { perm } = graph.get(t)?.op().clone() else {
                return Ok(false);
            };
            dims = dims.iter().map(|&d| perm[d]).collect();
            x = t;
            t = find_transpose_input(graph, x)?;
            if t == x || graph.get(t)?.kind() != OpKind::Transpose {
                break;
            }
        }
        if t == ins || graph.get(t)?.kind() != OpKind::Transpose {
            return Ok(false);
        }

        let base = graph.get(t)?.inputs()[0];
        if is_identity_permutation(&dims) {
            if graph.shape_of(base)? != graph.shape_of(ins)? {
                return Ok(false);
            }
            graph.replace_instruction(ins, base)?;
        } else {
            let folded = Op::Transpose { perm: dims };
            let expected = folded.infer_shape(&[graph.shape_of(base)?])?;
            if &expected != graph.shape_of(ins)? {
                return Ok(false);
            }
            graph.replace_with(ins, folded, [base])?;
        }
        Ok(true)
    }
}

/// When two or more slices of the same tensor each feed a transpose, hoists
/// one transpose above the slices: the slices then run on the transposed
/// tensor with remapped axes, and minority consumers get a small corrective
/// transpose.
pub struct HoistSliceTransposes;

impl Rule for HoistSliceTransposes {
    fn name(&self) -> &'static str {
        "hoist-slice-transposes"
    }

    fn matcher(&self) -> Matcher {
        any_of_outputs(all_of(vec![name(&[OpKind::Slice]), output(name(&[OpKind::Transpose]))]))
    }

    fn apply(&self, graph: &mut Module, result: &MatchResult) -> Result<bool, GraphError> {
        let ins = result.root;

        let mut splits: Vec<InsId> = Vec::new();
        for &out in graph.get(ins)?.outputs() {
            let node = graph.get(out)?;
            if node.kind() == OpKind::Slice
                && node.used_once()
                && graph.get(node.outputs()[0])?.kind() == OpKind::Transpose
                && !splits.contains(&out)
            {
                splits.push(out);
            }
        }
        if splits.len() < 2 {
            return Ok(false);
        }
        let transposes: Vec<InsId> = splits
            .iter()
            .map(|&s| graph.get(s).map(|n| n.outputs()[0]))
            .collect::<Result<_, _>>()?;

        // majority permutation; ties go to the lexicographically smallest
        let mut counts: BTreeMap<Vec<usize>, usize> = BTreeMap::new();
        for &t in &transposes {
            let Op::Transpose { perm } = graph.get(t)?.op() else {
                return Ok(false);
            };
            *counts.entry(perm.clone()).or_insert(0) += 1;
        }
        let mut perm: Vec<usize> = Vec::new();
        let mut best = 0;
        for (p, &n) in &counts {
            if n > best {
                best = n;
                perm = p.clone();
            }
        }
        let iperm = invert_permutation(&perm);

        let pre = graph.insert_instruction(Op::Transpose { perm: perm.clone() }, [ins])?;
        for (&split, &t) in splits.iter().zip(&transposes) {
            let Op::Slice { axes, starts, ends } = graph.get(split)?.op().clone() else {
                return Ok(false);
            };
            let new_axes: Vec<usize> = axes.iter().map(|&a| iperm[a]).collect();
            let mut new_ins =
                graph.insert_instruction(Op::Slice { axes: new_axes, starts, ends }, [pre])?;

            let Op::Transpose { perm: curr } = graph.get(t)?.op().clone() else {
                return Ok(false);
            };
            if curr != perm {
                let corrective: Vec<usize> = curr.iter().map(|&c| iperm[c]).collect();
                new_ins = graph.insert_instruction(Op::Transpose { perm: corrective }, [new_ins])?;
            }
            graph.replace_instruction(t, new_ins)?;
        }
        Ok(true)
    }
}

/// When every consumer of a transpose slices it with the same axes and the
/// same extent, splits the sliced axis into chunks before the transpose so
/// the slices become chunk selections. Handles the single-axis case only.
pub struct SplitTransposeSlices;

impl Rule for SplitTransposeSlices {
    fn name(&self) -> &'static str {
        "split-transpose-slices"
    }

    fn matcher(&self) -> Matcher {
        all_of(vec![name(&[OpKind::Transpose]), all_of_outputs(name(&[OpKind::Slice]))])
    }

    fn apply(&self, graph: &mut Module, result: &MatchResult) -> Result<bool, GraphError> {
        let ins = result.root;

        let mut slices: Vec<InsId> = Vec::new();
        for &out in graph.get(ins)?.outputs() {
            if !slices.contains(&out) {
                slices.push(out);
            }
        }
        if slices.is_empty() {
            return Ok(false);
        }

        let Op::Slice { axes: saxes, starts: first_starts, ends: first_ends } =
            graph.get(slices[0])?.op().clone()
        else {
            return Ok(false);
        };
        let sdistance: Vec<usize> =
            first_ends.iter().zip(&first_starts).map(|(e, s)| e - s).collect();
        for &s in &slices[1..] {
            let Op::Slice { axes, starts, ends } = graph.get(s)?.op().clone() else {
                return Ok(false);
            };
            if axes != saxes {
                return Ok(false);
            }
            let distance: Vec<usize> = ends.iter().zip(&starts).map(|(e, s)| e - s).collect();
            if distance != sdistance {
                return Ok(false);
            }
        }

        // the distance must evenly chunk the axis lengths and every bound
        let lens = graph.shape_of(ins)?.lens().to_vec();
        let divides =
            |v: &[usize]| v.iter().zip(&sdistance).all(|(&x, &d)| d != 0 && x % d == 0);
        let axis_lens: Vec<usize> = saxes.iter().map(|&a| lens[a]).collect();
        if !divides(&axis_lens) {
            return Ok(false);
        }
        for &s in &slices {
            let Op::Slice { starts, ends, .. } = graph.get(s)?.op().clone() else {
                return Ok(false);
            };
            if !divides(&starts) || !divides(&ends) {
                return Ok(false);
            }
        }

        // TODO: generalise to slices over several axes at once
        if saxes.len() != 1 {
            return Ok(false);
        }
        let axis = saxes[0];
        // nothing to gain when the sliced axis is already the leading one
        if lens[..axis].iter().all(|&l| l == 1) {
            return Ok(false);
        }

        let Op::Transpose { perm } = graph.get(ins)?.op().clone() else {
            return Ok(false);
        };
        let preaxis = perm[axis];
        let distance = sdistance[0];
        let steps = lens[axis] / distance;
        let input = graph.get(ins)?.inputs()[0];

        let unsqueeze = graph
            .insert_instruction(Op::Unsqueeze { axes: vec![preaxis], steps: vec![steps] }, [input])?;
        let mut chunk_perm: Vec<usize> =
            perm.iter().map(|&p| if p >= preaxis { p + 1 } else { p }).collect();
        chunk_perm.insert(0, preaxis);
        let transpose =
            graph.insert_instruction(Op::Transpose { perm: chunk_perm }, [unsqueeze])?;

        for &s in &slices {
            let Op::Slice { starts, ends, .. } = graph.get(s)?.op().clone() else {
                return Ok(false);
            };
            let chunk = graph.insert_instruction(
                Op::Slice {
                    axes: vec![0],
                    starts: vec![starts[0] / distance],
                    ends: vec![ends[0] / distance],
                },
                [transpose],
            )?;
            let squeezed = graph.insert_instruction(Op::Squeeze { axes: vec![0] }, [chunk])?;
            graph.replace_instruction(s, squeezed)?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        matcher::find_matches,
        shape::{DType, Shape},
        tensor::Values,
    };

    #[test]
    fn folds_transpose_chain_into_composed_permutation() -> Result<(), GraphError> {
        let mut graph = Module::new();
        let x = graph.add_parameter("x", Shape::standard(DType::F32, [2, 3, 4]));
        let t1 = graph.insert_instruction(Op::Transpose { perm: vec![1, 0, 2] }, [x])?;
        let t2 = graph.insert_instruction(Op::Transpose { perm: vec![0, 2, 1] }, [t1])?;
        graph.add_return(t2)?;

        let rules: Vec<Box<dyn Rule>> = vec![Box::new(FoldTransposeChains)];
        assert_eq!(find_matches(&mut graph, &rules)?, 1);
        graph.eliminate_dead_code()?;
        graph.check_valid()?;

        let ret = graph.returns()[0];
        let Op::Transpose { perm } = graph.get(ret)?.op() else {
            panic!("expected a transpose, got {}", graph.get(ret)?.op().opname());
        };
        assert_eq!(perm, &[1, 2, 0]);
        assert_eq!(graph.get(ret)?.inputs(), [x]);
        assert_eq!(graph.num_instructions(), 2);
        Ok(())
    }

    #[test]
    fn folds_inverse_transposes_to_nothing() -> Result<(), GraphError> {
        let mut graph = Module::new();
        let x = graph.add_parameter("x", Shape::standard(DType::F32, [2, 3]));
        let t1 = graph.insert_instruction(Op::Transpose { perm: vec![1, 0] }, [x])?;
        let t2 = graph.insert_instruction(Op::Transpose { perm: vec![1, 0] }, [t1])?;
        graph.add_return(t2)?;

        let rules: Vec<Box<dyn Rule>> = vec![Box::new(FoldTransposeChains)];
        assert_eq!(find_matches(&mut graph, &rules)?, 1);
        graph.eliminate_dead_code()?;
        graph.check_valid()?;

        assert_eq!(graph.returns(), [x]);
        assert_eq!(graph.num_instructions(), 1);
        Ok(())
    }

    #[test]
    fn declines_fold_when_contiguous_changes_layout() -> Result<(), GraphError> {
        let mut graph = Module::new();
        let x = graph.add_parameter("x", Shape::standard(DType::F32, [2, 3]));
        let t1 = graph.insert_instruction(Op::Transpose { perm: vec![1, 0] }, [x])?;
        let c = graph.insert_instruction(Op::Contiguous, [t1])?;
        let t2 = graph.insert_instruction(Op::Transpose { perm: vec![1, 0] }, [c])?;
        graph.add_return(t2)?;

        // the composed permutation is the identity, but the copy in the middle
        // gave t2 different strides than x, so the fold cannot substitute x
        let rules: Vec<Box<dyn Rule>> = vec![Box::new(FoldTransposeChains)];
        assert_eq!(find_matches(&mut graph, &rules)?, 0);
        graph.check_valid()?;
        Ok(())
    }

    #[test]
    fn hoists_shared_transpose_above_slices() -> Result<(), GraphError> {
        let mut graph = Module::new();
        let x = graph.add_parameter("x", Shape::standard(DType::F32, [2, 4, 6]));
        let s1 = graph.insert_instruction(
            Op::Slice { axes: vec![2], starts: vec![0], ends: vec![3] },
            [x],
        )?;
        let t1 = graph.insert_instruction(Op::Transpose { perm: vec![2, 0, 1] }, [s1])?;
        let s2 = graph.insert_instruction(
            Op::Slice { axes: vec![2], starts: vec![3], ends: vec![6] },
            [x],
        )?;
        let t2 = graph.insert_instruction(Op::Transpose { perm: vec![2, 0, 1] }, [s2])?;
        graph.add_return(t1)?;
        graph.add_return(t2)?;

        let mut inputs = HashMap::new();
        inputs.insert(x, Values::F32((0..48).map(|v| v as f32).collect()));
        let before = graph.evaluate(&inputs)?;
        let expected = (before[&t1].clone(), before[&t2].clone());

        let rules: Vec<Box<dyn Rule>> = vec![Box::new(HoistSliceTransposes)];
        assert_eq!(find_matches(&mut graph, &rules)?, 1);
        graph.eliminate_dead_code()?;
        graph.check_valid()?;

        // both returns are now slices of one shared transpose
        let (r1, r2) = (graph.returns()[0], graph.returns()[1]);
        assert_eq!(graph.get(r1)?.kind(), OpKind::Slice);
        assert_eq!(graph.get(r2)?.kind(), OpKind::Slice);
        let pre = graph.get(r1)?.inputs()[0];
        assert_eq!(pre, graph.get(r2)?.inputs()[0]);
        assert_eq!(graph.get(pre)?.kind(), OpKind::Transpose);

        let after = graph.evaluate(&inputs)?;
        assert_eq!(after[&r1], expected.0);
        assert_eq!(after[&r2], expected.1);
        Ok(())
    }

    #[test]
    fn minority_permutation_gets_corrective_transpose() -> Result<(), GraphError> {
        let mut graph = Module::new();
        let x = graph.add_parameter("x", Shape::standard(DType::F32, [2, 4, 6]));
        let mut terminals = Vec::new();
        for (range, perm) in
            [((0, 2), vec![2, 0, 1]), ((2, 4), vec![2, 0, 1]), ((4, 6), vec![0, 2, 1])]
        {
            let s = graph.insert_instruction(
                Op::Slice { axes: vec![2], starts: vec![range.0], ends: vec![range.1] },
                [x],
            )?;
            let t = graph.insert_instruction(Op::Transpose { perm }, [s])?;
            graph.add_return(t)?;
            terminals.push(t);
        }

        let mut inputs = HashMap::new();
        inputs.insert(x, Values::F32((0..48).map(|v| (v * 3 % 17) as f32).collect()));
        let before = graph.evaluate(&inputs)?;
        let expected: Vec<Values> = terminals.iter().map(|t| before[t].clone()).collect();

        let rules: Vec<Box<dyn Rule>> = vec![Box::new(HoistSliceTransposes)];
        assert_eq!(find_matches(&mut graph, &rules)?, 1);
        graph.eliminate_dead_code()?;
        graph.check_valid()?;

        let after = graph.evaluate(&inputs)?;
        for (ret, want) in graph.returns().iter().zip(&expected) {
            assert_eq!(&after[ret], want);
        }
        // the two majority consumers are plain slices, the minority one ends
        // in a corrective transpose
        assert_eq!(graph.get(graph.returns()[0])?.kind(), OpKind::Slice);
        assert_eq!(graph.get(graph.returns()[2])?.kind(), OpKind::Transpose);
        Ok(())
    }

    #[test]
    fn splits_transpose_into_chunked_slices() -> Result<(), GraphError> {
        let mut graph = Module::new();
        let x = graph.add_parameter("x", Shape::standard(DType::F32, [4, 3]));
        let t = graph.insert_instruction(Op::Transpose { perm: vec![1, 0] }, [x])?;
        let s1 = graph.insert_instruction(
            Op::Slice { axes: vec![1], starts: vec![0], ends: vec![2] },
            [t],
        )?;
        let s2 = graph.insert_instruction(
            Op::Slice { axes: vec![1], starts: vec![2], ends: vec![4] },
            [t],
        )?;
        graph.add_return(s1)?;
        graph.add_return(s2)?;

        let mut inputs = HashMap::new();
        inputs.insert(x, Values::F32((0..12).map(|v| v as f32).collect()));
        let before = graph.evaluate(&inputs)?;
        let expected = (before[&s1].clone(), before[&s2].clone());

        let rules: Vec<Box<dyn Rule>> = vec![Box::new(SplitTransposeSlices)];
        assert_eq!(find_matches(&mut graph, &rules)?, 1);
        graph.eliminate_dead_code()?;
        graph.check_valid()?;

        let (r1, r2) = (graph.returns()[0], graph.returns()[1]);
        assert_eq!(graph.get(r1)?.kind(), OpKind::Squeeze);
        assert_eq!(graph.get(r2)?.kind(), OpKind::Squeeze);

        let after = graph.evaluate(&inputs)?;
        assert_eq!(after[&r1], expected.0);
        assert_eq!(after[&r2], expected.1);
        Ok(())
    }

    #[test]
    fn split_declines_multi_axis_slices() -> Result<(), GraphError> {
        let mut graph = Module::new();
        let x = graph.add_parameter("x", Shape::standard(DType::F32, [4, 4]));
        let t = graph.insert_instruction(Op::Transpose { perm: vec![1, 0] }, [x])?;
        let s = graph.insert_instruction(
            Op::Slice { axes: vec![0, 1], starts: vec![0, 0], ends: vec![2, 2] },
            [t],
        )?;
        graph.add_return(s)?;

        let rules: Vec<Box<dyn Rule>> = vec![Box::new(SplitTransposeSlices)];
        assert_eq!(find_matches(&mut graph, &rules)?, 0);
        graph.check_valid()?;
        Ok(())
    }
}
