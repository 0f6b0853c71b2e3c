use tracing::debug;

use crate::{
    graph::{GraphError, Module},
    matcher::find_matches,
    rules::all_rules,
};

/// A whole-module transformation.
pub trait Pass {
    fn name(&self) -> &'static str;

    fn apply(&self, graph: &mut Module) -> Result<(), GraphError>;
}

/// Runs the shape-algebra rule set to a fixed point: each iteration scans the
/// graph once, applies the first matching rule per candidate and sweeps dead
/// code, stopping early when an iteration changes nothing.
pub struct SimplifyShapes {
    depth: usize,
}

impl SimplifyShapes {
    pub fn new(depth: usize) -> Self {
        Self { depth }
    }
}

impl Default for SimplifyShapes {
    fn default() -> Self {
        Self::new(4)
    }
}

impl Pass for SimplifyShapes {
    fn name(&self) -> &'static str {
        "simplify-shapes"
    }

    fn apply(&self, graph: &mut Module) -> Result<(), GraphError> {
        let rules = all_rules();
        for iteration in 0..self.depth {
            let applied = find_matches(graph, &rules)?;
            graph.eliminate_dead_code()?;
            debug!(iteration, applied, instructions = graph.num_instructions(), "simplify iteration");
            if applied == 0 {
                break;
            }
        }
        Ok(())
    }
}

/// Standalone dead-code sweep.
pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead-code-elimination"
    }

    fn apply(&self, graph: &mut Module) -> Result<(), GraphError> {
        graph.eliminate_dead_code()
    }
}
