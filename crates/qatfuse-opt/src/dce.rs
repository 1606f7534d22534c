//! Dead code elimination pass.

use qatfuse_ir::Graph;

use crate::Pass;
use crate::error::FusionError;

/// Removes nodes whose values never reach a graph output.
///
/// Placeholders and opaque operators are kept. The graph is committed
/// afterwards.
#[derive(Debug)]
pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &str {
        "dce"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool, FusionError> {
        let changed = graph.eliminate_dead_code();
        graph.commit()?;
        Ok(changed)
    }
}
