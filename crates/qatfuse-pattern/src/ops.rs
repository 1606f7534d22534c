//! Operator identity normalization.
//!
//! Graphs produced by different front ends may spell the same quantize /
//! dequantize operator with different overloads. An [`OperatorTable`] maps
//! operator kinds onto the form used for matching.

use qatfuse_ir::{Graph, NodeId, OpKind, Overload};

/// Maps operator kinds to their canonical form.
pub trait OperatorTable {
    fn canonicalize(&self, kind: &OpKind) -> OpKind;
}

/// Collapses every quantize / dequantize overload to [`Overload::Packet`].
#[derive(Clone, Copy, Debug, Default)]
pub struct OverloadAgnostic;

impl OperatorTable for OverloadAgnostic {
    fn canonicalize(&self, kind: &OpKind) -> OpKind {
        kind.with_overload(Overload::Packet)
    }
}

/// Identity table: overloads must match exactly.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExactOverloads;

impl OperatorTable for ExactOverloads {
    fn canonicalize(&self, kind: &OpKind) -> OpKind {
        kind.clone()
    }
}

/// Rewrites every node kind of `graph` through `table`.
///
/// Returns the number of nodes whose kind changed.
pub fn canonicalize_graph(graph: &mut Graph, table: &dyn OperatorTable) -> usize {
    canonicalize_graph_recording(graph, table).len()
}

/// Like [`canonicalize_graph`], but returns the previous kind of every node
/// it rewrote so the change can be undone with [`restore_kinds`].
pub fn canonicalize_graph_recording(
    graph: &mut Graph,
    table: &dyn OperatorTable,
) -> Vec<(NodeId, OpKind)> {
    let ids: Vec<NodeId> = graph.nodes().iter().map(|n| n.id).collect();
    let mut originals = Vec::new();
    for id in ids {
        let Some(node) = graph.node_mut(id) else {
            continue;
        };
        let canonical = table.canonicalize(&node.kind);
        if canonical != node.kind {
            originals.push((id, std::mem::replace(&mut node.kind, canonical)));
        }
    }
    originals
}

/// Puts back kinds recorded by [`canonicalize_graph_recording`].
///
/// Nodes that have since been removed from the graph are skipped.
pub fn restore_kinds(graph: &mut Graph, originals: Vec<(NodeId, OpKind)>) {
    for (id, kind) in originals {
        if let Some(node) = graph.node_mut(id) {
            node.kind = kind;
        }
    }
}
