use crate::{
    graph::{
        operator::{Op, OpKind, RESHAPERS},
        GraphError, Module,
    },
    matcher::{
        all_of, any, arg, args, either_arg, name, nargs, none_of_outputs, pointwise,
        same_shape_as_arg, skip, transposed_shape, used_once, MatchResult, Matcher, Rule,
    },
};

/// Operators that never change the underlying values, only the shape.
const NOOP_CANDIDATES: &[OpKind] = &[
    OpKind::Reshape,
    OpKind::Flatten,
    OpKind::Squeeze,
    OpKind::Unsqueeze,
    OpKind::Contiguous,
    OpKind::Transpose,
    OpKind::Slice,
    OpKind::Concat,
    OpKind::Convert,
    OpKind::MultiBroadcast,
];

/// Collapses a chain of layout reinterpretations ending at the candidate
/// into a single reshape from the base of the chain, inserting a contiguous
/// first if the base is a view.
pub struct CollapseReshapes;

impl Rule for CollapseReshapes {
    fn name(&self) -> &'static str {
        "collapse-reshapes"
    }

    fn matcher(&self) -> Matcher {
        all_of(vec![
            name(RESHAPERS),
            // only fire at the end of the chain
            none_of_outputs(name(RESHAPERS)),
            arg(0, skip(&[OpKind::Contiguous], name(RESHAPERS))),
            skip(RESHAPERS, any().bind("base")),
        ])
    }

    fn apply(&self, graph: &mut Module, result: &MatchResult) -> Result<bool, GraphError> {
        let ins = result.root;
        if !graph.shape_of(ins)?.is_standard() {
            return Ok(false);
        }
        let dims = graph.shape_of(ins)?.lens().to_vec();

        let mut base = result.get("base");
        if !graph.shape_of(base)?.is_standard() {
            base = graph.insert_instruction(Op::Contiguous, [base])?;
        }
        graph.replace_with(ins, Op::Reshape { dims }, [base])?;
        Ok(true)
    }
}

/// Removes shape operators whose output shape equals their input's shape
/// exactly, strides included.
pub struct RemoveNoops;

impl Rule for RemoveNoops {
    fn name(&self) -> &'static str {
        "remove-noops"
    }

    fn matcher(&self) -> Matcher {
        all_of(vec![name(NOOP_CANDIDATES), same_shape_as_arg(0)])
    }

    fn apply(&self, graph: &mut Module, result: &MatchResult) -> Result<bool, GraphError> {
        let input = graph.get(result.root)?.inputs()[0];
        graph.replace_instruction(result.root, input)?;
        Ok(true)
    }
}

/// Moves a reshape-of-contiguous operand below a two-argument pointwise
/// operator, so the pointwise runs on the pre-reshape lengths and the
/// reshape happens once, after it.
pub struct PushReshapeThroughPointwise;

impl Rule for PushReshapeThroughPointwise {
    fn name(&self) -> &'static str {
        "push-reshape-through-pointwise"
    }

    fn matcher(&self) -> Matcher {
        let reshaped = all_of(vec![
            name(&[OpKind::Reshape]),
            args(vec![name(&[OpKind::Contiguous]).bind("cont")]),
        ])
        .bind("rsp");
        all_of(vec![pointwise(), nargs(2), either_arg(0, 1, reshaped, any())])
    }

    fn apply(&self, graph: &mut Module, result: &MatchResult) -> Result<bool, GraphError> {
        let ins = result.root;
        let rsp = result.get("rsp");
        let cont = result.get("cont");

        if graph.shape_of(rsp)? != graph.shape_of(ins)? {
            return Ok(false);
        }
        let operands = graph.get(ins)?.inputs().to_vec();
        for &operand in &operands {
            if !graph.shape_of(operand)?.is_standard() {
                return Ok(false);
            }
        }

        let cont_input = graph.get(cont)?.inputs()[0];
        let dims = graph.shape_of(cont_input)?.lens().to_vec();
        let out_dims = graph.shape_of(ins)?.lens().to_vec();

        let mut moved_inputs = Vec::with_capacity(operands.len());
        for &operand in &operands {
            if operand == rsp {
                moved_inputs.push(cont_input);
            } else {
                moved_inputs
                    .push(graph.insert_instruction(Op::Reshape { dims: dims.clone() }, [operand])?);
            }
        }
        let op = graph.get(ins)?.op().clone();
        let moved = graph.insert_instruction(op, moved_inputs)?;
        graph.replace_with(ins, Op::Reshape { dims: out_dims }, [moved])?;
        Ok(true)
    }
}

/// Hoists a single-argument pointwise operator above a
/// transpose -> contiguous -> reshaper chain, so it runs on the transposed
/// view directly.
pub struct HoistUnaryAboveContiguousReshape;

impl Rule for HoistUnaryAboveContiguousReshape {
    fn name(&self) -> &'static str {
        "hoist-unary-above-contiguous-reshape"
    }

    fn matcher(&self) -> Matcher {
        let cont = all_of(vec![
            name(&[OpKind::Contiguous]),
            used_once(),
            args(vec![transposed_shape().bind("trans")]),
        ]);
        let reshaper = all_of(vec![
            name(&[OpKind::Reshape, OpKind::Squeeze, OpKind::Unsqueeze]),
            used_once(),
            args(vec![cont]),
        ])
        .bind("reshaper");
        all_of(vec![pointwise(), nargs(1), args(vec![reshaper])])
    }

    fn apply(&self, graph: &mut Module, result: &MatchResult) -> Result<bool, GraphError> {
        let ins = result.root;
        let trans = result.get("trans");
        let unary_op = graph.get(ins)?.op().clone();
        let reshaper_op = graph.get(result.get("reshaper"))?.op().clone();

        let lifted = graph.insert_instruction(unary_op, [trans])?;
        let packed = graph.insert_instruction(Op::Contiguous, [lifted])?;
        graph.replace_with(ins, reshaper_op, [packed])?;
        Ok(true)
    }
}
