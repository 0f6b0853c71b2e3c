use crate::{
    graph::{
        instruction::InsId,
        operator::{Op, OpKind},
        GraphError, Module,
    },
    matcher::{all_of, all_of_inputs, any_of_inputs, name, MatchResult, Matcher, Rule},
    rules::replace_packed,
    shape::{find_permutation, invert_permutation},
};

fn concat_axis(graph: &Module, ins: InsId) -> Result<Option<usize>, GraphError> {
    match graph.get(ins)?.op() {
        Op::Concat { axis } => Ok(Some(*axis)),
        _ => Ok(None),
    }
}

/// Flattens concats of concats along the same axis into one wide concat,
/// as long as the inner concats have no other consumers.
pub struct FlattenNestedConcats;

impl Rule for FlattenNestedConcats {
    fn name(&self) -> &'static str {
        "flatten-nested-concats"
    }

    fn matcher(&self) -> Matcher {
        all_of(vec![name(&[OpKind::Concat]), any_of_inputs(name(&[OpKind::Concat]))])
    }

    fn apply(&self, graph: &mut Module, result: &MatchResult) -> Result<bool, GraphError> {
        let ins = result.root;
        let Some(axis) = concat_axis(graph, ins)? else {
            return Ok(false);
        };

        let mut args = Vec::new();
        let mut pending: Vec<InsId> = graph.get(ins)?.inputs().iter().rev().copied().collect();
        while let Some(id) = pending.pop() {
            let node = graph.get(id)?;
            if concat_axis(graph, id)? == Some(axis) && node.used_once() {
                pending.extend(node.inputs().iter().rev().copied());
            } else {
                args.push(id);
            }
        }
        if args == graph.get(ins)?.inputs() {
            return Ok(false);
        }

        graph.replace_with(ins, Op::Concat { axis }, args)?;
        Ok(true)
    }
}

/// Hoists a shared broadcast out of a concat: concatenating broadcast copies
/// is the same as concatenating the small tensors and broadcasting once,
/// provided the concat axis itself is not broadcast.
pub struct HoistConcatMultibroadcasts;

impl Rule for HoistConcatMultibroadcasts {
    fn name(&self) -> &'static str {
        "hoist-concat-multibroadcasts"
    }

    fn matcher(&self) -> Matcher {
        all_of(vec![name(&[OpKind::Concat]), all_of_inputs(name(&[OpKind::MultiBroadcast]))])
    }

    fn apply(&self, graph: &mut Module, result: &MatchResult) -> Result<bool, GraphError> {
        let ins = result.root;
        let Some(axis) = concat_axis(graph, ins)? else {
            return Ok(false);
        };
        let broadcasts = graph.get(ins)?.inputs().to_vec();
        for &b in &broadcasts {
            if graph.shape_of(b)?.strides()[axis] == 0 {
                return Ok(false);
            }
        }

        let out_lens = graph.shape_of(ins)?.lens().to_vec();
        let in_strides = graph.shape_of(broadcasts[0])?.strides().to_vec();
        let sources: Vec<InsId> = broadcasts
            .iter()
            .map(|&b| graph.get(b).map(|n| n.inputs()[0]))
            .collect::<Result<_, _>>()?;

        // the concat axis moves inward past the axes the broadcast introduced
        let mut new_axis = axis;
        if graph.shape_of(sources[0])?.rank() < out_lens.len() {
            new_axis -= in_strides[..axis].iter().filter(|&&s| s == 0).count();
        }

        let concat = graph.insert_instruction(Op::Concat { axis: new_axis }, sources)?;
        let hoisted =
            graph.insert_instruction(Op::MultiBroadcast { out_lens }, [concat])?;
        replace_packed(graph, ins, hoisted)?;
        Ok(true)
    }
}

/// Hoists a shared transpose out of a concat: when every input is transposed
/// the same way, concatenate the untransposed values along the mapped axis
/// and transpose the result once.
pub struct HoistConcatTransposes;

impl Rule for HoistConcatTransposes {
    fn name(&self) -> &'static str {
        "hoist-concat-transposes"
    }

    fn matcher(&self) -> Matcher {
        all_of(vec![name(&[OpKind::Concat]), all_of_inputs(name(&[OpKind::Transpose]))])
    }

    fn apply(&self, graph: &mut Module, result: &MatchResult) -> Result<bool, GraphError> {
        let ins = result.root;
        let Some(axis) = concat_axis(graph, ins)? else {
            return Ok(false);
        };
        let inputs = graph.get(ins)?.inputs().to_vec();

        if !graph.shape_of(inputs[0])?.is_transposed() {
            return Ok(false);
        }
        let perm = find_permutation(graph.shape_of(inputs[0])?);
        for &input in &inputs[1..] {
            if find_permutation(graph.shape_of(input)?) != perm {
                return Ok(false);
            }
        }
        let iperm = invert_permutation(&perm);
        let new_axis = iperm[axis];

        let normalised: Vec<InsId> = inputs
            .iter()
            .map(|&input| graph.insert_instruction(Op::Transpose { perm: perm.clone() }, [input]))
            .collect::<Result<_, _>>()?;
        let concat = graph.insert_instruction(Op::Concat { axis: new_axis }, normalised)?;
        let hoisted = graph.insert_instruction(Op::Transpose { perm: iperm }, [concat])?;
        replace_packed(graph, ins, hoisted)?;
        Ok(true)
    }
}
