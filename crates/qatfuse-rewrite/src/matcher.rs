//! Structural subgraph matching.
//!
//! A pattern is a [`Graph`] with placeholder inputs and exactly one output.
//! Every target node is tried as the image of the pattern output (the
//! *anchor*); the match then grows backwards along operand edges.

use std::collections::{BTreeMap, HashMap, HashSet};

use qatfuse_ir::{Graph, NodeId, OpKind, Operand};

use crate::error::RewriteError;

/// Matching knobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatcherOptions {
    /// Treat any two literal operands as equal.
    pub ignore_literals: bool,
    /// Drop matches that share interior nodes with an earlier match.
    pub remove_overlapping: bool,
}

impl Default for MatcherOptions {
    fn default() -> Self {
        Self {
            ignore_literals: false,
            remove_overlapping: true,
        }
    }
}

/// One occurrence of a pattern in a target graph.
#[derive(Clone, Debug, PartialEq)]
pub struct InternalMatch {
    /// Target node matched to the pattern output.
    pub anchor: NodeId,
    /// Pattern node to target node, for every non-placeholder pattern node.
    pub nodes_map: BTreeMap<NodeId, NodeId>,
    /// Target operand bound to each pattern placeholder, in placeholder
    /// order. Placeholders the pattern never uses are bound to
    /// [`Operand::None`].
    pub placeholder_bindings: Vec<Operand>,
}

impl InternalMatch {
    /// Target nodes owned by the match.
    pub fn interior(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes_map.values().copied()
    }

    /// Returns `true` if `target` is an interior node of the match.
    pub fn contains(&self, target: NodeId) -> bool {
        self.nodes_map.values().any(|&n| n == target)
    }

    /// Target node matched to pattern node `pattern`.
    pub fn target_of(&self, pattern: NodeId) -> Option<NodeId> {
        self.nodes_map.get(&pattern).copied()
    }
}

#[derive(Clone, Default)]
struct MatchState {
    nodes: HashMap<NodeId, NodeId>,
    bindings: HashMap<NodeId, Operand>,
    used: HashSet<NodeId>,
}

/// Finds occurrences of one pattern graph.
pub struct SubgraphMatcher<'p> {
    pattern: &'p Graph,
    output: NodeId,
    placeholders: Vec<NodeId>,
    options: MatcherOptions,
}

impl<'p> SubgraphMatcher<'p> {
    /// Prepares `pattern` for matching.
    ///
    /// The pattern must have exactly one output, produced by a
    /// non-placeholder node.
    pub fn new(pattern: &'p Graph, options: MatcherOptions) -> Result<Self, RewriteError> {
        let [output] = pattern.outputs[..] else {
            return Err(RewriteError::InvalidPattern(format!(
                "expected exactly one output, found {}",
                pattern.outputs.len()
            )));
        };
        match pattern.node(output) {
            None => {
                return Err(RewriteError::InvalidPattern(format!(
                    "output {output} is not part of the pattern"
                )));
            }
            Some(node) if node.kind == OpKind::Placeholder => {
                return Err(RewriteError::InvalidPattern(
                    "pattern output is a placeholder".into(),
                ));
            }
            Some(_) => {}
        }
        Ok(Self {
            pattern,
            output,
            placeholders: pattern.placeholders(),
            options,
        })
    }

    /// All matches in `target`, in anchor order.
    pub fn find_matches(&self, target: &Graph) -> Vec<InternalMatch> {
        let mut matches = Vec::new();
        for candidate in target.nodes() {
            let mut state = MatchState::default();
            if !self.match_node(self.output, candidate.id, target, &mut state) {
                continue;
            }
            let found = self.finish(candidate.id, state);
            if !is_contained(&found, target) {
                log::debug!(
                    "match anchored at '{}' leaks interior values, skipped",
                    candidate.name
                );
                continue;
            }
            matches.push(found);
        }
        if self.options.remove_overlapping {
            matches = remove_overlapping(matches);
        }
        matches
    }

    fn is_placeholder(&self, pn: NodeId) -> bool {
        self.pattern
            .node(pn)
            .is_some_and(|n| n.kind == OpKind::Placeholder)
    }

    fn bind_placeholder(&self, pn: NodeId, operand: &Operand, state: &mut MatchState) -> bool {
        if let Some(bound) = state.bindings.get(&pn) {
            return bound == operand;
        }
        if let Operand::Node(gn) = operand
            && !state.used.insert(*gn)
        {
            return false;
        }
        state.bindings.insert(pn, operand.clone());
        true
    }

    fn match_node(&self, pn: NodeId, gn: NodeId, target: &Graph, state: &mut MatchState) -> bool {
        if self.is_placeholder(pn) {
            return self.bind_placeholder(pn, &Operand::Node(gn), state);
        }
        if let Some(&bound) = state.nodes.get(&pn) {
            return bound == gn;
        }
        if state.used.contains(&gn) {
            return false;
        }
        let (Some(p), Some(g)) = (self.pattern.node(pn), target.node(gn)) else {
            return false;
        };
        if p.kind != g.kind || p.operands.len() != g.operands.len() {
            return false;
        }

        let saved = state.clone();
        state.nodes.insert(pn, gn);
        state.used.insert(gn);
        for (po, go) in p.operands.iter().zip(&g.operands) {
            if !self.match_operand(po, go, target, state) {
                *state = saved;
                return false;
            }
        }
        true
    }

    fn match_operand(&self, po: &Operand, go: &Operand, target: &Graph, state: &mut MatchState) -> bool {
        match (po, go) {
            (Operand::Node(pn), _) if self.is_placeholder(*pn) => self.bind_placeholder(*pn, go, state),
            (Operand::Node(pn), Operand::Node(gn)) => self.match_node(*pn, *gn, target, state),
            (Operand::Node(_), _) | (_, Operand::Node(_)) => false,
            _ => self.options.ignore_literals || po == go,
        }
    }

    fn finish(&self, anchor: NodeId, state: MatchState) -> InternalMatch {
        let placeholder_bindings = self
            .placeholders
            .iter()
            .map(|p| state.bindings.get(p).cloned().unwrap_or(Operand::None))
            .collect();
        InternalMatch {
            anchor,
            nodes_map: state.nodes.into_iter().collect(),
            placeholder_bindings,
        }
    }
}

/// Interior nodes other than the anchor may only feed other interior nodes.
fn is_contained(m: &InternalMatch, target: &Graph) -> bool {
    m.interior().filter(|&gn| gn != m.anchor).all(|gn| {
        !target.is_output(gn) && target.users(gn).into_iter().all(|u| m.contains(u))
    })
}

fn remove_overlapping(matches: Vec<InternalMatch>) -> Vec<InternalMatch> {
    let mut claimed: HashSet<NodeId> = HashSet::new();
    matches
        .into_iter()
        .filter(|m| {
            if m.interior().any(|gn| claimed.contains(&gn)) {
                log::debug!("match anchored at {} overlaps an earlier match", m.anchor);
                return false;
            }
            claimed.extend(m.interior());
            true
        })
        .collect()
}
