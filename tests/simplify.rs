use std::collections::HashMap;

use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use tenfold::{
    graph::operator::{BinaryOp, Op, OpKind, UnaryOp},
    DType, GraphError, Module, Pass, Shape, SimplifyShapes, Values,
};

fn random_values(rng: &mut StdRng, elements: usize) -> Values {
    Values::F32((0..elements).map(|_| rng.sample(StandardNormal)).collect())
}

fn seeded_inputs(graph: &Module, seed: u64) -> HashMap<tenfold::graph::instruction::InsId, Values> {
    let mut rng = StdRng::seed_from_u64(seed);
    graph
        .params()
        .iter()
        .map(|&p| (p, random_values(&mut rng, graph.shape_of(p).unwrap().elements())))
        .collect()
}

fn returned_values(graph: &Module, seed: u64) -> Result<Vec<Values>, GraphError> {
    let computed = graph.evaluate(&seeded_inputs(graph, seed))?;
    Ok(graph.returns().iter().map(|r| computed[r].clone()).collect())
}

/// A module exercising most of the rewrite surface at once.
fn busy_module() -> Result<Module, GraphError> {
    let mut graph = Module::new();
    let x = graph.add_parameter("x", Shape::standard(DType::F32, [2, 3, 4]));
    let y = graph.add_parameter("y", Shape::standard(DType::F32, [24]));
    let z = graph.add_parameter("z", Shape::standard(DType::F32, [16]));

    // transpose chain ending in a pointwise over a reshaped copy
    let t1 = graph.insert_instruction(Op::Transpose { perm: vec![1, 0, 2] }, [x])?;
    let t2 = graph.insert_instruction(Op::Transpose { perm: vec![0, 2, 1] }, [t1])?;
    let cont = graph.insert_instruction(Op::Contiguous, [t2])?;
    let flat = graph.insert_instruction(Op::Reshape { dims: vec![24] }, [cont])?;
    let add = graph.insert_instruction(Op::Binary(BinaryOp::Add), [y, flat])?;
    graph.add_return(add)?;

    // reshaper chain
    let r1 = graph.insert_instruction(Op::Reshape { dims: vec![6, 4] }, [cont])?;
    let r2 = graph.insert_instruction(Op::Flatten { axis: 1 }, [r1])?;
    let r3 = graph.insert_instruction(Op::Unsqueeze { axes: vec![0], steps: vec![1] }, [r2])?;
    graph.add_return(r3)?;

    // nested slices and a unary on top
    let s1 = graph.insert_instruction(Op::Slice { axes: vec![0], starts: vec![1], ends: vec![14] }, [z])?;
    let s2 = graph.insert_instruction(Op::Slice { axes: vec![0], starts: vec![2], ends: vec![8] }, [s1])?;
    let abs = graph.insert_instruction(Op::Unary(UnaryOp::Abs), [s2])?;
    graph.add_return(abs)?;

    // nested concats
    let c1 = graph.insert_instruction(Op::Concat { axis: 0 }, [y, y])?;
    let c2 = graph.insert_instruction(Op::Concat { axis: 0 }, [c1, y])?;
    graph.add_return(c2)?;

    // a convert round trip over integral values, which the elision keeps exact
    let ints = graph.add_literal([4], Values::I32(vec![3, -7, 11, 0]))?;
    let as_f32 = graph.insert_instruction(Op::Convert { dtype: DType::F32 }, [ints])?;
    let back = graph.insert_instruction(Op::Convert { dtype: DType::I32 }, [as_f32])?;
    graph.add_return(back)?;

    graph.check_valid()?;
    Ok(graph)
}

#[test]
fn pass_preserves_module_validity() -> Result<(), GraphError> {
    let mut graph = busy_module()?;
    SimplifyShapes::default().apply(&mut graph)?;
    graph.check_valid()
}

#[test]
fn pass_shrinks_the_busy_module() -> Result<(), GraphError> {
    let mut graph = busy_module()?;
    let before = graph.num_instructions();
    SimplifyShapes::default().apply(&mut graph)?;
    assert!(graph.num_instructions() < before);

    let order = graph.topo_order()?;
    let kind = |i: &tenfold::graph::instruction::InsId| graph.get(*i).unwrap().kind();

    // the transpose chain composed away entirely: t2 = transpose([0,2,1]) of
    // transpose([1,0,2]) is transpose([1,2,0]), and the reshape chain behind
    // it collapsed to a single reshape
    let transposes = order.iter().filter(|i| kind(i) == OpKind::Transpose).count();
    assert_eq!(transposes, 1);
    let slices = order.iter().filter(|i| kind(i) == OpKind::Slice).count();
    assert_eq!(slices, 1);
    let concats = order.iter().filter(|i| kind(i) == OpKind::Concat).count();
    assert_eq!(concats, 1);
    let converts = order.iter().filter(|i| kind(i) == OpKind::Convert).count();
    assert_eq!(converts, 0);
    Ok(())
}

#[test]
fn merged_slice_covers_the_right_window() -> Result<(), GraphError> {
    let mut graph = Module::new();
    let z = graph.add_parameter("z", Shape::standard(DType::F32, [16]));
    let s1 = graph.insert_instruction(Op::Slice { axes: vec![0], starts: vec![1], ends: vec![10] }, [z])?;
    let s2 = graph.insert_instruction(Op::Slice { axes: vec![0], starts: vec![2], ends: vec![8] }, [s1])?;
    graph.add_return(s2)?;

    SimplifyShapes::default().apply(&mut graph)?;
    graph.check_valid()?;

    let ret = graph.returns()[0];
    assert_eq!(
        graph.get(ret)?.op(),
        &Op::Slice { axes: vec![0], starts: vec![3], ends: vec![9] }
    );
    assert_eq!(graph.get(ret)?.inputs(), [z]);
    Ok(())
}

#[test]
fn pass_is_value_preserving() -> Result<(), GraphError> {
    for seed in 0..8 {
        let mut graph = busy_module()?;
        let before = returned_values(&graph, seed)?;
        SimplifyShapes::default().apply(&mut graph)?;
        let after = returned_values(&graph, seed)?;
        assert_eq!(before, after, "values diverged for seed {seed}");
    }
    Ok(())
}

#[test]
fn pass_is_idempotent() -> Result<(), GraphError> {
    let mut graph = busy_module()?;
    SimplifyShapes::default().apply(&mut graph)?;
    let settled = graph.to_string();
    SimplifyShapes::default().apply(&mut graph)?;
    assert_eq!(graph.to_string(), settled);
    Ok(())
}

#[test]
fn pass_leaves_no_dead_instructions() -> Result<(), GraphError> {
    let mut graph = busy_module()?;
    SimplifyShapes::default().apply(&mut graph)?;
    for ins in graph.topo_order()? {
        let node = graph.get(ins)?;
        assert!(
            !node.outputs().is_empty() || graph.is_return(ins) || graph.is_param(ins),
            "{ins:?} survived the pass with no uses"
        );
    }
    Ok(())
}

#[test]
fn resize_pattern_is_rewritten_end_to_end() -> Result<(), GraphError> {
    let mut graph = Module::new();
    let x = graph.add_parameter("x", Shape::standard(DType::F32, [2, 2]));
    let flat = graph.insert_instruction(Op::Reshape { dims: vec![4] }, [x])?;
    // 2x nearest-neighbour upscale of the trailing axis
    let ind = graph.add_literal([2, 4], Values::I32(vec![0, 0, 1, 1, 2, 2, 3, 3]))?;
    let gathered = graph.insert_instruction(Op::Gather { axis: 0 }, [flat, ind])?;
    graph.add_return(gathered)?;

    let before = returned_values(&graph, 11)?;
    SimplifyShapes::default().apply(&mut graph)?;
    graph.check_valid()?;
    assert_eq!(returned_values(&graph, 11)?, before);

    let order = graph.topo_order()?;
    assert!(order.iter().all(|&i| graph.get(i).unwrap().kind() != OpKind::Gather));
    Ok(())
}

#[test]
fn deep_transpose_chain_folds_completely() -> Result<(), GraphError> {
    let mut graph = Module::new();
    let x = graph.add_parameter("x", Shape::standard(DType::F32, [2, 3]));
    let mut cur = x;
    for _ in 0..6 {
        cur = graph.insert_instruction(Op::Transpose { perm: vec![1, 0] }, [cur])?;
    }
    graph.add_return(cur)?;

    SimplifyShapes::default().apply(&mut graph)?;
    graph.check_valid()?;
    assert_eq!(graph.returns(), [x]);
    assert_eq!(graph.num_instructions(), 1);
    Ok(())
}

#[test]
fn zero_depth_leaves_the_module_alone() -> Result<(), GraphError> {
    let mut graph = busy_module()?;
    let before = graph.to_string();
    SimplifyShapes::new(0).apply(&mut graph)?;
    assert_eq!(graph.to_string(), before);
    Ok(())
}
