use crate::{
    graph::{
        operator::{Op, OpKind},
        GraphError, Module,
    },
    matcher::{all_of, arg, args, is_constant, name, MatchResult, Matcher, Rule},
    shape::{row_major_index, row_major_multi},
};

/// Recognises a nearest-neighbour resize expressed as a gather of flattened
/// data with a constant replication index, and rewrites it as
/// reshape -> broadcast -> contiguous -> reshape.
pub struct RecognizeResize;

impl Rule for RecognizeResize {
    fn name(&self) -> &'static str {
        "recognize-resize"
    }

    fn matcher(&self) -> Matcher {
        all_of(vec![
            name(&[OpKind::Gather]),
            args(vec![name(&[OpKind::Reshape]).bind("data"), is_constant().bind("ind")]),
        ])
    }

    fn apply(&self, graph: &mut Module, result: &MatchResult) -> Result<bool, GraphError> {
        let ins = result.root;
        let rsp = result.get("data");
        let ind = result.get("ind");

        if graph.shape_of(rsp)?.rank() != 1 {
            return Ok(false);
        }
        let base = graph.get(rsp)?.inputs()[0];
        let in_lens = graph.shape_of(base)?.lens().to_vec();
        let out_lens = graph.shape_of(ins)?.lens().to_vec();
        if in_lens.len() != out_lens.len() {
            return Ok(false);
        }

        // each output axis must be an integer upscale of its input axis
        let mut scales = Vec::with_capacity(in_lens.len());
        for (&i, &o) in in_lens.iter().zip(&out_lens) {
            if i == 0 || o % i != 0 {
                return Ok(false);
            }
            scales.push(o / i);
        }

        let Some(values) = graph.eval_constant(ind) else {
            return Ok(false);
        };
        let Some(indices) = values.as_i32() else {
            return Ok(false);
        };
        let elements: usize = out_lens.iter().product();
        if indices.len() != elements {
            return Ok(false);
        }
        // the index must be constant within every scale block
        for k in 0..elements {
            let om = row_major_multi(&out_lens, k);
            let block: Vec<usize> = om.iter().zip(&scales).map(|(&i, &s)| i - i % s).collect();
            if indices[k] != indices[row_major_index(&out_lens, &block)] {
                return Ok(false);
            }
        }

        // interleave a length-1 axis per upscaled input axis, broadcast it to
        // the scale, then pack and reshape to the final lengths
        let mut in_dims = Vec::new();
        let mut broadcast_dims = Vec::new();
        for (&len, &scale) in in_lens.iter().zip(&scales) {
            in_dims.push(len);
            broadcast_dims.push(len * scale);
            if len == 1 || scale == 1 {
                continue;
            }
            let last = broadcast_dims.len() - 1;
            broadcast_dims[last] = len;
            in_dims.push(1);
            broadcast_dims.push(scale);
        }

        let reshaped = graph.insert_instruction(Op::Reshape { dims: in_dims }, [base])?;
        let broadcast =
            graph.insert_instruction(Op::MultiBroadcast { out_lens: broadcast_dims }, [reshaped])?;
        let packed = graph.insert_instruction(Op::Contiguous, [broadcast])?;
        graph.replace_with(ins, Op::Reshape { dims: out_lens }, [packed])?;
        Ok(true)
    }
}

/// Recognises a two-way select over a concat of two equal-shape tensors
/// whose constant predicate is uniform, and passes the chosen operand
/// straight through.
pub struct RecognizeConstWhere;

impl Rule for RecognizeConstWhere {
    fn name(&self) -> &'static str {
        "recognize-const-where"
    }

    fn matcher(&self) -> Matcher {
        let data = all_of(vec![
            name(&[OpKind::Reshape]),
            arg(0, name(&[OpKind::Concat]).bind("concat")),
        ]);
        all_of(vec![name(&[OpKind::Gather]), args(vec![data, is_constant().bind("ind")])])
    }

    fn apply(&self, graph: &mut Module, result: &MatchResult) -> Result<bool, GraphError> {
        let ins = result.root;
        let concat = result.get("concat");
        let ind = result.get("ind");

        let Some(values) = graph.eval_constant(ind) else {
            return Ok(false);
        };
        let Some(indices) = values.as_i32() else {
            return Ok(false);
        };
        let Some(&first) = indices.first() else {
            return Ok(false);
        };
        let truth = first != 0;
        if indices.iter().any(|&i| (i != 0) != truth) {
            return Ok(false);
        }

        let Op::Concat { axis: 0 } = graph.get(concat)?.op() else {
            return Ok(false);
        };
        let operands = graph.get(concat)?.inputs().to_vec();
        if operands.len() != 2 {
            return Ok(false);
        }
        if graph.shape_of(operands[0])? != graph.shape_of(operands[1])? {
            return Ok(false);
        }
        if graph.shape_of(operands[0])?.lens() != graph.shape_of(ind)?.lens() {
            return Ok(false);
        }

        let chosen = if truth { operands[0] } else { operands[1] };
        crate::rules::replace_packed(graph, ins, chosen)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        graph::instruction::InsId,
        matcher::find_matches,
        shape::{DType, Shape},
        tensor::Values,
    };

    fn nearest_neighbour_indices(in_lens: &[usize], scales: &[usize]) -> Vec<i32> {
        let out_lens: Vec<usize> = in_lens.iter().zip(scales).map(|(&l, &s)| l * s).collect();
        let elements: usize = out_lens.iter().product();
        (0..elements)
            .map(|k| {
                let om = row_major_multi(&out_lens, k);
                let im: Vec<usize> = om.iter().zip(scales).map(|(&i, &s)| i / s).collect();
                row_major_index(in_lens, &im) as i32
            })
            .collect()
    }

    #[test]
    fn rewrites_resize_gather_to_broadcast() -> Result<(), GraphError> {
        let mut graph = Module::new();
        let x = graph.add_parameter("x", Shape::standard(DType::F32, [2, 2]));
        let flat = graph.insert_instruction(Op::Reshape { dims: vec![4] }, [x])?;
        let ind = graph.add_literal([2, 4], Values::I32(nearest_neighbour_indices(&[2, 2], &[1, 2])))?;
        let gathered = graph.insert_instruction(Op::Gather { axis: 0 }, [flat, ind])?;
        graph.add_return(gathered)?;

        let mut inputs = HashMap::new();
        inputs.insert(x, Values::F32(vec![1.0, 2.0, 3.0, 4.0]));
        let expected = graph.evaluate(&inputs)?[&gathered].clone();
        assert_eq!(expected, Values::F32(vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0]));

        let rules: Vec<Box<dyn Rule>> = vec![Box::new(RecognizeResize)];
        assert_eq!(find_matches(&mut graph, &rules)?, 1);
        graph.eliminate_dead_code()?;
        graph.check_valid()?;

        let order = graph.topo_order()?;
        let kinds: Vec<OpKind> =
            order.iter().map(|&i| graph.get(i).unwrap().kind()).collect();
        assert!(!kinds.contains(&OpKind::Gather));
        assert!(kinds.contains(&OpKind::MultiBroadcast));

        let after = graph.evaluate(&inputs)?;
        assert_eq!(after[&graph.returns()[0]], expected);
        Ok(())
    }

    #[test]
    fn resize_declines_non_replicating_indices() -> Result<(), GraphError> {
        let mut graph = Module::new();
        let x = graph.add_parameter("x", Shape::standard(DType::F32, [2, 2]));
        let flat = graph.insert_instruction(Op::Reshape { dims: vec![4] }, [x])?;
        // a gather that reverses rather than replicates
        let ind = graph.add_literal([2, 4], Values::I32(vec![3, 2, 1, 0, 3, 2, 1, 0]))?;
        let gathered = graph.insert_instruction(Op::Gather { axis: 0 }, [flat, ind])?;
        graph.add_return(gathered)?;

        let rules: Vec<Box<dyn Rule>> = vec![Box::new(RecognizeResize)];
        assert_eq!(find_matches(&mut graph, &rules)?, 0);
        graph.check_valid()?;
        Ok(())
    }

    fn where_graph(predicate: i32) -> (Module, InsId, InsId, InsId) {
        let mut graph = Module::new();
        let a = graph.add_parameter("a", Shape::standard(DType::F32, [2, 2]));
        let b = graph.add_parameter("b", Shape::standard(DType::F32, [2, 2]));
        let cat = graph.insert_instruction(Op::Concat { axis: 0 }, [a, b]).unwrap();
        let flat = graph.insert_instruction(Op::Reshape { dims: vec![8] }, [cat]).unwrap();
        let ind = graph.add_literal([2, 2], Values::I32(vec![predicate; 4])).unwrap();
        let gathered = graph.insert_instruction(Op::Gather { axis: 0 }, [flat, ind]).unwrap();
        graph.add_return(gathered).unwrap();
        (graph, a, b, gathered)
    }

    #[test]
    fn uniform_predicate_selects_an_operand() -> Result<(), GraphError> {
        let (mut graph, a, _, _) = where_graph(1);
        let rules: Vec<Box<dyn Rule>> = vec![Box::new(RecognizeConstWhere)];
        assert_eq!(find_matches(&mut graph, &rules)?, 1);
        graph.eliminate_dead_code()?;
        graph.check_valid()?;
        assert_eq!(graph.returns(), [a]);

        let (mut graph, _, b, _) = where_graph(0);
        assert_eq!(find_matches(&mut graph, &rules)?, 1);
        graph.eliminate_dead_code()?;
        graph.check_valid()?;
        assert_eq!(graph.returns(), [b]);
        Ok(())
    }

    #[test]
    fn mixed_predicate_declines() -> Result<(), GraphError> {
        let mut graph = Module::new();
        let a = graph.add_parameter("a", Shape::standard(DType::F32, [2, 2]));
        let b = graph.add_parameter("b", Shape::standard(DType::F32, [2, 2]));
        let cat = graph.insert_instruction(Op::Concat { axis: 0 }, [a, b])?;
        let flat = graph.insert_instruction(Op::Reshape { dims: vec![8] }, [cat])?;
        let ind = graph.add_literal([2, 2], Values::I32(vec![0, 1, 0, 1]))?;
        let gathered = graph.insert_instruction(Op::Gather { axis: 0 }, [flat, ind])?;
        graph.add_return(gathered)?;

        let rules: Vec<Box<dyn Rule>> = vec![Box::new(RecognizeConstWhere)];
        assert_eq!(find_matches(&mut graph, &rules)?, 0);
        graph.check_valid()?;
        Ok(())
    }
}
