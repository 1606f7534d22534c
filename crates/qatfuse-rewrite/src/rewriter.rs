//! Pattern replacement.
//!
//! Every accepted match is spliced out of the target graph and replaced by a
//! fresh copy of the replacement graph, wired to the match's boundary values.

use std::collections::{BTreeMap, HashMap};

use qatfuse_ir::{Graph, Node, NodeId, NodeMeta, OpKind, Operand};

use crate::error::RewriteError;
use crate::filter::{MatchFilter, accept_all};
use crate::matcher::{InternalMatch, MatcherOptions, SubgraphMatcher};

/// Snapshot of a target node removed by a rewrite.
#[derive(Clone, Debug, PartialEq)]
pub struct OriginalNode {
    /// Pattern node it was matched to.
    pub pattern: NodeId,
    /// The node as it was before the rewrite.
    pub node: Node,
    /// Its metadata, if it had any.
    pub meta: Option<NodeMeta>,
}

/// Record of one applied rewrite.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplacedPattern {
    /// Target node that produced the matched value.
    pub anchor: NodeId,
    /// Pattern node to (removed) target node.
    pub nodes_map: BTreeMap<NodeId, NodeId>,
    /// Boundary values the replacement was wired to, in placeholder order.
    pub placeholder_bindings: Vec<Operand>,
    /// Interior nodes that were removed, in pattern order.
    pub originals: Vec<OriginalNode>,
    /// Inserted nodes, in replacement order. The last one produces the
    /// replacement output.
    pub replacements: Vec<NodeId>,
}

impl ReplacedPattern {
    /// Snapshot of the original node of the given kind, if exactly one exists.
    pub fn original_of_kind(&self, kind: &OpKind) -> Option<&OriginalNode> {
        let mut found = self.originals.iter().filter(|o| &o.node.kind == kind);
        let first = found.next()?;
        found.next().is_none().then_some(first)
    }
}

/// Replaces every occurrence of `pattern` in `target` that passes all
/// `filters` with a copy of `replacement`.
///
/// Matches are found and filtered against the unmodified graph; rewrites are
/// then applied in anchor order. The graph is left uncommitted.
pub fn replace_pattern_with_filters(
    target: &mut Graph,
    pattern: &Graph,
    replacement: &Graph,
    filters: &[MatchFilter],
    ignore_literals: bool,
) -> Result<Vec<ReplacedPattern>, RewriteError> {
    check_replacement(pattern, replacement)?;
    let matcher = SubgraphMatcher::new(
        pattern,
        MatcherOptions {
            ignore_literals,
            remove_overlapping: true,
        },
    )?;

    let mut accepted = Vec::new();
    for m in matcher.find_matches(target) {
        if accept_all(filters, &m, target, pattern)? {
            accepted.push(m);
        } else {
            log::debug!("match anchored at {} rejected by filters", m.anchor);
        }
    }

    let mut changed = HashMap::new();
    accepted
        .iter()
        .map(|m| apply(target, pattern, replacement, m, &mut changed))
        .collect()
}

/// Replaces a single match.
pub fn rewrite(
    target: &mut Graph,
    pattern: &Graph,
    replacement: &Graph,
    m: &InternalMatch,
) -> Result<ReplacedPattern, RewriteError> {
    check_replacement(pattern, replacement)?;
    apply(target, pattern, replacement, m, &mut HashMap::new())
}

fn check_replacement(pattern: &Graph, replacement: &Graph) -> Result<(), RewriteError> {
    if replacement.outputs.len() != 1 {
        return Err(RewriteError::InvalidReplacement(format!(
            "expected exactly one output, found {}",
            replacement.outputs.len()
        )));
    }
    let (p, r) = (pattern.placeholders().len(), replacement.placeholders().len());
    if p != r {
        return Err(RewriteError::ArityMismatch {
            pattern: p,
            replacement: r,
        });
    }
    Ok(())
}

/// Follows earlier replacements so a binding never names an erased anchor.
fn resolve(changed: &HashMap<NodeId, NodeId>, mut id: NodeId) -> NodeId {
    while let Some(&next) = changed.get(&id) {
        id = next;
    }
    id
}

fn apply(
    target: &mut Graph,
    pattern: &Graph,
    replacement: &Graph,
    m: &InternalMatch,
    changed: &mut HashMap<NodeId, NodeId>,
) -> Result<ReplacedPattern, RewriteError> {
    let bindings: Vec<Operand> = m
        .placeholder_bindings
        .iter()
        .map(|b| match b {
            Operand::Node(id) => {
                let id = resolve(changed, *id);
                if target.contains(id) {
                    Ok(Operand::Node(id))
                } else {
                    Err(RewriteError::StaleMatch(id))
                }
            }
            other => Ok(other.clone()),
        })
        .collect::<Result<_, _>>()?;

    let mut originals = Vec::with_capacity(m.nodes_map.len());
    for pn in pattern.nodes().iter().map(|n| n.id) {
        let Some(gn) = m.target_of(pn) else {
            continue;
        };
        let node = target.node(gn).ok_or(RewriteError::StaleMatch(gn))?;
        originals.push(OriginalNode {
            pattern: pn,
            node: node.clone(),
            meta: target.meta.get(gn).cloned(),
        });
    }

    let mut val_map: HashMap<NodeId, Operand> = replacement
        .placeholders()
        .into_iter()
        .zip(bindings.iter().cloned())
        .collect();
    let mut replacements = Vec::new();
    for rnode in replacement.nodes() {
        if rnode.kind == OpKind::Placeholder {
            continue;
        }
        let operands = rnode
            .operands
            .iter()
            .map(|op| match op {
                Operand::Node(id) => val_map.get(id).cloned().ok_or_else(|| {
                    RewriteError::InvalidReplacement(format!(
                        "node '{}' uses {id} before it is defined",
                        rnode.name
                    ))
                }),
                other => Ok(other.clone()),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if let OpKind::GetAttr { target: name } = &rnode.kind
            && let Some(value) = replacement.constant(name)
        {
            target
                .constants
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        let id = target.insert_node_before(m.anchor, rnode.kind.clone(), operands, &rnode.name)?;
        val_map.insert(rnode.id, Operand::Node(id));
        replacements.push(id);
    }

    let out = replacement.outputs[0];
    let Some(Operand::Node(new_out)) = val_map.get(&out).cloned() else {
        return Err(RewriteError::InvalidReplacement(
            "replacement output does not produce a node".into(),
        ));
    };
    target.replace_all_uses(m.anchor, new_out);
    changed.insert(m.anchor, new_out);

    for original in originals.iter().rev() {
        target.erase_node(original.node.id)?;
    }

    log::debug!(
        "replaced {} node(s) anchored at {} with {} node(s)",
        originals.len(),
        m.anchor,
        replacements.len()
    );
    Ok(ReplacedPattern {
        anchor: m.anchor,
        nodes_map: m.nodes_map.clone(),
        placeholder_bindings: bindings,
        originals,
        replacements,
    })
}
