//! Graph validation pass.
//!
//! Re-checks every structural invariant and logs warnings for states that
//! are legal but usually unintended. This pass never modifies the graph.

use std::collections::HashSet;

use qatfuse_ir::{Graph, OpKind};

use crate::Pass;
use crate::error::FusionError;

/// Fails on structural violations; warns about constants nothing loads.
#[derive(Debug)]
pub struct GraphValidation;

impl Pass for GraphValidation {
    fn name(&self) -> &str {
        "graph-validation"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool, FusionError> {
        graph.validate()?;
        for name in orphan_constants(graph) {
            log::warn!("constant '{name}' is stored but never loaded");
        }
        Ok(false)
    }
}

/// Names of stored constants that no [`OpKind::GetAttr`] node loads.
pub fn orphan_constants(graph: &Graph) -> Vec<&str> {
    let loaded: HashSet<&str> = graph
        .nodes()
        .iter()
        .filter_map(|n| match &n.kind {
            OpKind::GetAttr { target } => Some(target.as_str()),
            _ => None,
        })
        .collect();
    graph
        .constants
        .keys()
        .map(String::as_str)
        .filter(|name| !loaded.contains(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;
    use qatfuse_ir::{IrError, NodeId};

    #[test]
    fn reports_orphans_without_failing() {
        let mut g = Graph::new();
        let w = g.add_constant("w", ArrayD::zeros(vec![2]));
        g.constants.insert("stale".into(), ArrayD::zeros(vec![1]));
        g.outputs = vec![w];
        assert_eq!(GraphValidation.run(&mut g), Ok(false));
        assert_eq!(orphan_constants(&g), vec!["stale"]);
    }

    #[test]
    fn rejects_dangling_output() {
        let mut g = Graph::new();
        g.placeholder("x");
        g.outputs = vec![NodeId(42)];
        assert_eq!(
            GraphValidation.run(&mut g),
            Err(FusionError::Ir(IrError::DanglingOutput(NodeId(42))))
        );
    }
}
