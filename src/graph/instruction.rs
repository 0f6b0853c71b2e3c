use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    graph::operator::{Op, OpKind},
    shape::Shape,
};

/// Identifier of an instruction, unique across all modules in the process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsId(usize);

impl Default for InsId {
    fn default() -> Self {
        static COUNT: AtomicUsize = AtomicUsize::new(0);
        Self(COUNT.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Debug for InsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// A single node of the instruction graph: an operator, its inferred output
/// shape, the ordered producers of its operands and back-references to its
/// consumers (one entry per consuming edge).
#[derive(Clone, Debug)]
pub struct Instruction {
    pub(super) op: Op,
    pub(super) shape: Shape,
    pub(super) inputs: Vec<InsId>,
    pub(super) outputs: Vec<InsId>,
}

impl Instruction {
    pub(super) fn new(op: Op, shape: Shape, inputs: Vec<InsId>) -> Self {
        Self { op, shape, inputs, outputs: Vec::new() }
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Producers of this instruction's operands, in operand order.
    pub fn inputs(&self) -> &[InsId] {
        &self.inputs
    }

    /// Consumers of this instruction, one entry per consuming edge.
    pub fn outputs(&self) -> &[InsId] {
        &self.outputs
    }

    pub fn used_once(&self) -> bool {
        self.outputs.len() == 1
    }
}
