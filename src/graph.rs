pub mod instruction;
pub mod operator;

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
};

use thiserror::Error;
use tracing::trace;

use crate::{
    graph::{
        instruction::{InsId, Instruction},
        operator::{Op, OpKind},
    },
    shape::Shape,
    tensor::Values,
};

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("instruction {0:?} does not exist")]
    InsDoesNotExist(InsId),
    #[error("shape inference failed: {0}")]
    ShapeInference(String),
    #[error("cannot replace {old:?} with {new:?}: output shapes differ")]
    ReplaceMismatch { old: InsId, new: InsId },
    #[error("instruction {0:?} still has uses")]
    NotDead(InsId),
    #[error("graph contains a cycle")]
    Cyclic,
    #[error("{0}")]
    Message(String),
}

impl From<String> for GraphError {
    fn from(msg: String) -> Self {
        Self::Message(msg)
    }
}

/// A mutable DAG of instructions with explicit parameters and returns.
///
/// Every mutation keeps the use-def edges symmetric and every instruction's
/// shape equal to what its operator infers from its inputs; [`Module::check_valid`]
/// re-verifies both from scratch.
#[derive(Clone, Debug, Default)]
pub struct Module {
    instructions: HashMap<InsId, Instruction>,
    params: Vec<InsId>,
    returns: Vec<InsId>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_instructions(&self) -> usize {
        self.instructions.len()
    }

    pub fn contains(&self, ins: InsId) -> bool {
        self.instructions.contains_key(&ins)
    }

    pub fn get(&self, ins: InsId) -> Result<&Instruction, GraphError> {
        self.instructions.get(&ins).ok_or(GraphError::InsDoesNotExist(ins))
    }

    fn get_mut(&mut self, ins: InsId) -> Result<&mut Instruction, GraphError> {
        self.instructions.get_mut(&ins).ok_or(GraphError::InsDoesNotExist(ins))
    }

    pub fn shape_of(&self, ins: InsId) -> Result<&Shape, GraphError> {
        Ok(self.get(ins)?.shape())
    }

    pub fn params(&self) -> &[InsId] {
        &self.params
    }

    pub fn returns(&self) -> &[InsId] {
        &self.returns
    }

    pub fn is_param(&self, ins: InsId) -> bool {
        self.params.contains(&ins)
    }

    pub fn is_return(&self, ins: InsId) -> bool {
        self.returns.contains(&ins)
    }

    /// Adds a named graph input.
    pub fn add_parameter(&mut self, name: impl Into<String>, shape: Shape) -> InsId {
        let id = InsId::default();
        let op = Op::Param { name: name.into(), shape: shape.clone() };
        self.instructions.insert(id, Instruction::new(op, shape, Vec::new()));
        self.params.push(id);
        id
    }

    /// Adds a compile-time constant.
    pub fn add_literal(&mut self, lens: impl Into<Vec<usize>>, data: Values) -> Result<InsId, GraphError> {
        self.insert_instruction(Op::Literal { lens: lens.into(), data }, [])
    }

    /// Marks an existing instruction as a graph output.
    pub fn add_return(&mut self, ins: InsId) -> Result<(), GraphError> {
        self.get(ins)?;
        self.returns.push(ins);
        Ok(())
    }

    /// Inserts a new instruction, inferring its shape from its inputs.
    /// On any failure the module is left untouched.
    pub fn insert_instruction(
        &mut self,
        op: Op,
        inputs: impl Into<Vec<InsId>>,
    ) -> Result<InsId, GraphError> {
        let inputs = inputs.into();
        let in_shapes = inputs.iter().map(|&i| self.shape_of(i)).collect::<Result<Vec<_>, _>>()?;
        let shape = op.infer_shape(&in_shapes)?;

        let id = InsId::default();
        for &input in &inputs {
            // checked above
            if let Some(producer) = self.instructions.get_mut(&input) {
                producer.outputs.push(id);
            }
        }
        self.instructions.insert(id, Instruction::new(op, shape, inputs));
        Ok(id)
    }

    /// Redirects every consumer of `old` (and every return slot) to `new`.
    /// The two must have structurally equal shapes; `old` is left in place,
    /// dead, for [`Module::eliminate_dead_code`] to collect.
    pub fn replace_instruction(&mut self, old: InsId, new: InsId) -> Result<(), GraphError> {
        if old == new {
            return Ok(());
        }
        if self.get(old)?.shape() != self.get(new)?.shape() {
            return Err(GraphError::ReplaceMismatch { old, new });
        }

        let consumers = std::mem::take(&mut self.get_mut(old)?.outputs);
        for &consumer in &consumers {
            // one outputs entry per edge, so swap exactly one slot per entry
            let ins = self.get_mut(consumer)?;
            if let Some(slot) = ins.inputs.iter_mut().find(|i| **i == old) {
                *slot = new;
            }
        }
        self.get_mut(new)?.outputs.extend(consumers);

        for ret in &mut self.returns {
            if *ret == old {
                *ret = new;
            }
        }

        trace!(old = ?old, new = ?new, "replaced instruction");
        Ok(())
    }

    /// Inserts a new instruction and replaces `old` with it.
    pub fn replace_with(
        &mut self,
        old: InsId,
        op: Op,
        inputs: impl Into<Vec<InsId>>,
    ) -> Result<InsId, GraphError> {
        let new = self.insert_instruction(op, inputs)?;
        self.replace_instruction(old, new)?;
        Ok(new)
    }

    /// Removes an instruction that has no consumers and is not a return.
    pub fn erase_instruction(&mut self, ins: InsId) -> Result<(), GraphError> {
        if !self.get(ins)?.outputs.is_empty() || self.is_return(ins) {
            return Err(GraphError::NotDead(ins));
        }

        let inputs = self.get(ins)?.inputs.clone();
        for input in inputs {
            let producer = self.get_mut(input)?;
            if let Some(pos) = producer.outputs.iter().position(|&o| o == ins) {
                producer.outputs.remove(pos);
            }
        }

        self.params.retain(|&p| p != ins);
        self.instructions.remove(&ins);
        Ok(())
    }

    /// Erases every instruction not reachable from a return, keeping
    /// parameters. Sweeps until nothing dies.
    pub fn eliminate_dead_code(&mut self) -> Result<(), GraphError> {
        loop {
            let mut dead: Vec<InsId> = self
                .instructions
                .iter()
                .filter(|(&id, ins)| {
                    ins.outputs.is_empty() && !self.is_return(id) && !self.is_param(id)
                })
                .map(|(&id, _)| id)
                .collect();
            if dead.is_empty() {
                return Ok(());
            }
            dead.sort();
            for id in dead {
                trace!(ins = ?id, "erasing dead instruction");
                self.erase_instruction(id)?;
            }
        }
    }

    /// Kahn's algorithm over the use-def edges, always emitting the smallest
    /// ready id first so the order is deterministic and close to insertion
    /// order. Fails if the graph has a cycle.
    pub fn topo_order(&self) -> Result<Vec<InsId>, GraphError> {
        let mut remaining: HashMap<InsId, usize> = HashMap::new();
        for (&id, ins) in &self.instructions {
            let mut unique: HashSet<InsId> = ins.inputs.iter().copied().collect();
            unique.retain(|i| self.contains(*i));
            remaining.insert(id, unique.len());
        }

        let mut ready: BTreeSet<InsId> =
            remaining.iter().filter(|(_, &n)| n == 0).map(|(&id, _)| id).collect();
        let mut order = Vec::with_capacity(self.instructions.len());

        while let Some(&id) = ready.iter().next() {
            ready.remove(&id);
            order.push(id);
            let consumers: HashSet<InsId> = self.get(id)?.outputs.iter().copied().collect();
            for consumer in consumers {
                if let Some(n) = remaining.get_mut(&consumer) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(consumer);
                    }
                }
            }
        }

        if order.len() == self.instructions.len() {
            Ok(order)
        } else {
            Err(GraphError::Cyclic)
        }
    }

    /// Re-verifies every structural invariant: acyclicity, symmetric use-def
    /// edges, re-derivable shapes and resolvable params/returns.
    pub fn check_valid(&self) -> Result<(), GraphError> {
        self.topo_order()?;

        for (&id, ins) in &self.instructions {
            let in_shapes =
                ins.inputs.iter().map(|&i| self.shape_of(i)).collect::<Result<Vec<_>, _>>()?;
            let inferred = ins.op().infer_shape(&in_shapes)?;
            if &inferred != ins.shape() {
                return Err(GraphError::Message(format!(
                    "instruction {id:?} has shape {:?} but infers {inferred:?}",
                    ins.shape()
                )));
            }

            for &input in &ins.inputs {
                let forward = ins.inputs.iter().filter(|&&i| i == input).count();
                let backward = self.get(input)?.outputs.iter().filter(|&&o| o == id).count();
                if forward != backward {
                    return Err(GraphError::Message(format!(
                        "asymmetric edges between {input:?} and {id:?}"
                    )));
                }
            }
            for &output in &ins.outputs {
                let consumer = self.get(output)?;
                if !consumer.inputs.contains(&id) {
                    return Err(GraphError::Message(format!(
                        "stale output edge from {id:?} to {output:?}"
                    )));
                }
            }
        }

        for &param in &self.params {
            if self.get(param)?.kind() != OpKind::Param {
                return Err(GraphError::Message(format!("{param:?} is not a parameter")));
            }
        }
        for &ret in &self.returns {
            self.get(ret)?;
        }

        Ok(())
    }

    /// Runs the whole graph as an interpreter, seeding parameters from
    /// `inputs`, and returns the values of every instruction.
    pub fn evaluate(&self, inputs: &HashMap<InsId, Values>) -> Result<HashMap<InsId, Values>, GraphError> {
        for (&id, values) in inputs {
            let ins = self.get(id)?;
            if ins.kind() != OpKind::Param {
                return Err(GraphError::Message(format!("{id:?} is not a parameter")));
            }
            if values.len() != ins.shape().elements() || values.dtype() != ins.shape().dtype() {
                return Err(GraphError::Message(format!("seed for {id:?} does not fit its shape")));
            }
        }

        let mut computed: HashMap<InsId, Values> = HashMap::new();
        for id in self.topo_order()? {
            let ins = self.get(id)?;
            let values = if ins.kind() == OpKind::Param {
                inputs
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| GraphError::Message(format!("parameter {id:?} was not seeded")))?
            } else {
                let args = ins
                    .inputs()
                    .iter()
                    .map(|&i| Ok((self.shape_of(i)?, &computed[&i])))
                    .collect::<Result<Vec<_>, GraphError>>()?;
                ins.op().evaluate(&args, ins.shape())?
            };
            computed.insert(id, values);
        }
        Ok(computed)
    }

    /// Evaluates an instruction if its transitive inputs are all literals.
    pub fn eval_constant(&self, ins: InsId) -> Option<Values> {
        let mut needed: HashSet<InsId> = HashSet::new();
        let mut stack = vec![ins];
        while let Some(id) = stack.pop() {
            let node = self.get(id).ok()?;
            if node.kind() == OpKind::Param {
                return None;
            }
            if needed.insert(id) {
                stack.extend_from_slice(node.inputs());
            }
        }

        let mut computed: HashMap<InsId, Values> = HashMap::new();
        for id in self.topo_order().ok()? {
            if !needed.contains(&id) {
                continue;
            }
            let node = self.get(id).ok()?;
            let args = node
                .inputs()
                .iter()
                .map(|&i| (self.get(i).map(Instruction::shape), computed.get(&i)))
                .map(|(s, v)| Some((s.ok()?, v?)))
                .collect::<Option<Vec<_>>>()?;
            let values = node.op().evaluate(&args, node.shape()).ok()?;
            computed.insert(id, values);
        }
        computed.remove(&ins)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {{")?;
        let order = self.topo_order().map_err(|_| fmt::Error)?;
        for id in order {
            let ins = &self.instructions[&id];
            write!(f, "    {id:?}: {:?} = {}", ins.shape(), ins.op().opname())?;
            match ins.op() {
                Op::Param { name, .. } => write!(f, "[{name}]")?,
                Op::Reshape { dims } => write!(f, "[dims={dims:?}]")?,
                Op::Flatten { axis } => write!(f, "[axis={axis}]")?,
                Op::Squeeze { axes } => write!(f, "[axes={axes:?}]")?,
                Op::Unsqueeze { axes, steps } => write!(f, "[axes={axes:?}, steps={steps:?}]")?,
                Op::Gather { axis } => write!(f, "[axis={axis}]")?,
                Op::Transpose { perm } => write!(f, "[perm={perm:?}]")?,
                Op::Slice { axes, starts, ends } => {
                    write!(f, "[axes={axes:?}, starts={starts:?}, ends={ends:?}]")?
                }
                Op::Concat { axis } => write!(f, "[axis={axis}]")?,
                Op::MultiBroadcast { out_lens } => write!(f, "[out_lens={out_lens:?}]")?,
                Op::Convert { dtype } => write!(f, "[dtype={dtype:?}]")?,
                _ => {}
            }
            let args: Vec<String> = ins.inputs().iter().map(|i| format!("{i:?}")).collect();
            writeln!(f, "({})", args.join(", "))?;
        }
        let rets: Vec<String> = self.returns.iter().map(|i| format!("{i:?}")).collect();
        writeln!(f, "    return {}", rets.join(", "))?;
        write!(f, "}}")
    }
}
