//! Ordered dataflow graph of tensor operators.
//!
//! A [`Graph`] is an acyclic, ordered list of [`Node`]s. Edges are implicit in
//! operand references: every [`Operand::Node`] must point at a node placed
//! earlier in the list. Constant tensors live in the graph's constant storage
//! and are loaded through [`OpKind::GetAttr`] nodes; per-node metadata lives in
//! the [`MetaTable`] side-table.

use std::collections::{BTreeMap, HashSet};

use ndarray::ArrayD;

use crate::error::IrError;
use crate::meta::MetaTable;
use crate::types::Scalar;

/// Dense `f32` tensor stored in a graph's constant storage.
pub type Tensor = ArrayD<f32>;

/// A unique identifier for a node in a graph. Identities are never reused.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct NodeId(pub u32);

/// Overload selector of the quantize/dequantize operator families.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Overload {
    /// Scalar scale / zero-point arguments.
    Default,
    /// Tensor scale / zero-point arguments.
    Tensor,
    /// Overload-agnostic form, as emitted by convert.
    Packet,
}

/// The operation performed by a graph node.
///
/// This is a closed set: anything the passes do not understand is kept as an
/// [`OpKind::Opaque`] leaf and never evaluated.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum OpKind {
    /// Graph input.
    Placeholder,
    /// Loads the named tensor from constant storage.
    GetAttr { target: String },
    /// `convolution(input, weight, bias, stride, padding, dilation, transposed,
    /// output_padding, groups)`.
    Convolution,
    /// `native_batch_norm(input, weight, bias, running_mean, running_var,
    /// training, momentum, eps)`, producing `(output, save_mean, save_rstd)`.
    NativeBatchNorm,
    /// `getitem(tuple, index)`.
    GetItem,
    /// `quantize_per_tensor(x, scale, zero_point, quant_min, quant_max, dtype)`.
    QuantizePerTensor(Overload),
    /// `dequantize_per_tensor(x, scale, zero_point, quant_min, quant_max, dtype)`.
    DequantizePerTensor(Overload),
    /// `quantize_per_channel(x, scales, zero_points, axis, quant_min, quant_max, dtype)`.
    QuantizePerChannel(Overload),
    /// `dequantize_per_channel(x, scales, zero_points, axis, quant_min, quant_max, dtype)`.
    DequantizePerChannel(Overload),
    /// Element-wise addition.
    Add,
    /// Element-wise subtraction.
    Sub,
    /// Element-wise multiplication.
    Mul,
    /// Element-wise division.
    Div,
    /// Element-wise square root.
    Sqrt,
    /// `reshape(x, shape)`; one dimension may be `-1`.
    Reshape,
    /// `zeros_like(x, dtype)`.
    ZerosLike,
    /// Operator unknown to the passes.
    Opaque { name: String },
}

impl OpKind {
    /// Returns `true` for either quantize family.
    pub fn is_quantize(&self) -> bool {
        matches!(self, Self::QuantizePerTensor(_) | Self::QuantizePerChannel(_))
    }

    /// Returns `true` for either dequantize family.
    pub fn is_dequantize(&self) -> bool {
        matches!(
            self,
            Self::DequantizePerTensor(_) | Self::DequantizePerChannel(_)
        )
    }

    /// Overload of a quantize/dequantize operator.
    pub fn overload(&self) -> Option<Overload> {
        match self {
            Self::QuantizePerTensor(o)
            | Self::DequantizePerTensor(o)
            | Self::QuantizePerChannel(o)
            | Self::DequantizePerChannel(o) => Some(*o),
            _ => None,
        }
    }

    /// Same operator with a different overload; other kinds are returned unchanged.
    pub fn with_overload(&self, overload: Overload) -> Self {
        match self {
            Self::QuantizePerTensor(_) => Self::QuantizePerTensor(overload),
            Self::DequantizePerTensor(_) => Self::DequantizePerTensor(overload),
            Self::QuantizePerChannel(_) => Self::QuantizePerChannel(overload),
            Self::DequantizePerChannel(_) => Self::DequantizePerChannel(overload),
            other => other.clone(),
        }
    }

    /// Short operator name used for node naming.
    pub fn short_name(&self) -> &str {
        match self {
            Self::Placeholder => "placeholder",
            Self::GetAttr { .. } => "get_attr",
            Self::Convolution => "convolution",
            Self::NativeBatchNorm => "native_batch_norm",
            Self::GetItem => "getitem",
            Self::QuantizePerTensor(_) => "quantize_per_tensor",
            Self::DequantizePerTensor(_) => "dequantize_per_tensor",
            Self::QuantizePerChannel(_) => "quantize_per_channel",
            Self::DequantizePerChannel(_) => "dequantize_per_channel",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Sqrt => "sqrt",
            Self::Reshape => "reshape",
            Self::ZerosLike => "zeros_like",
            Self::Opaque { name } => name,
        }
    }
}

/// A literal (non-tensor) operand value.
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
    Ints(Vec<i64>),
    Dtype(Scalar),
}

impl Literal {
    /// Integer value, if this is an [`Literal::Int`].
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float value; integers are widened.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Boolean value, if this is a [`Literal::Bool`].
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer list, if this is a [`Literal::Ints`].
    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Self::Ints(v) => Some(v),
            _ => None,
        }
    }
}

/// A node operand: another node's value, a literal, or absent.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Node(NodeId),
    Literal(Literal),
    None,
}

impl Operand {
    /// Referenced node, if any.
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Self::Node(id) => Some(*id),
            _ => None,
        }
    }

    /// Literal value, if any.
    pub fn as_literal(&self) -> Option<&Literal> {
        match self {
            Self::Literal(lit) => Some(lit),
            _ => None,
        }
    }

    /// Returns `true` for [`Operand::None`].
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl From<NodeId> for Operand {
    fn from(id: NodeId) -> Self {
        Self::Node(id)
    }
}

impl From<Literal> for Operand {
    fn from(lit: Literal) -> Self {
        Self::Literal(lit)
    }
}

impl From<Option<NodeId>> for Operand {
    fn from(id: Option<NodeId>) -> Self {
        id.map_or(Self::None, Self::Node)
    }
}

/// A node in the graph.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: NodeId,
    /// Unique human-readable name.
    pub name: String,
    /// The operation this node performs.
    pub kind: OpKind,
    /// Ordered operands.
    pub operands: Vec<Operand>,
}

impl Node {
    /// Ids of node-valued operands, in operand order.
    pub fn node_operands(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.operands.iter().filter_map(Operand::as_node)
    }

    /// Operand at `index`.
    pub fn operand(&self, index: usize) -> Option<&Operand> {
        self.operands.get(index)
    }

    /// Returns `true` if any operand refers to `id`.
    pub fn uses(&self, id: NodeId) -> bool {
        self.operands.iter().any(|o| o.as_node() == Some(id))
    }
}

/// An acyclic, ordered dataflow graph.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    /// Graph-level outputs.
    pub outputs: Vec<NodeId>,
    /// Named constant tensors loaded by [`OpKind::GetAttr`] nodes.
    pub constants: BTreeMap<String, Tensor>,
    /// Per-node metadata.
    pub meta: MetaTable,
    next_node_id: u32,
    dirty: bool,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a graph input.
    pub fn placeholder(&mut self, name: &str) -> NodeId {
        self.add_node(OpKind::Placeholder, Vec::new(), name)
    }

    /// Appends a load of constant `target`.
    pub fn get_attr(&mut self, target: &str) -> NodeId {
        let name = target.replace('.', "_");
        self.add_node(
            OpKind::GetAttr {
                target: target.to_string(),
            },
            Vec::new(),
            &name,
        )
    }

    /// Stores `value` as constant `target` and appends a load of it.
    pub fn add_constant(&mut self, target: &str, value: Tensor) -> NodeId {
        self.constants.insert(target.to_string(), value);
        self.get_attr(target)
    }

    /// Appends a node and returns its id.
    ///
    /// The name is made unique by suffixing if needed.
    ///
    /// # Panics
    ///
    /// Panics if an operand refers to a node that is not in the graph.
    pub fn add_node(&mut self, kind: OpKind, operands: Vec<Operand>, name: &str) -> NodeId {
        self.check_operands_exist(&operands, name);
        let node = self.make_node(kind, operands, name);
        let id = node.id;
        self.nodes.push(node);
        self.dirty = true;
        id
    }

    /// Inserts a node immediately before `anchor` and returns its id.
    ///
    /// # Panics
    ///
    /// Panics if an operand refers to a node that is not in the graph.
    pub fn insert_node_before(
        &mut self,
        anchor: NodeId,
        kind: OpKind,
        operands: Vec<Operand>,
        name: &str,
    ) -> Result<NodeId, IrError> {
        let pos = self.position(anchor).ok_or(IrError::UnknownNode(anchor))?;
        self.check_operands_exist(&operands, name);
        let node = self.make_node(kind, operands, name);
        let id = node.id;
        self.nodes.insert(pos, node);
        self.dirty = true;
        Ok(id)
    }

    fn check_operands_exist(&self, operands: &[Operand], name: &str) {
        for id in operands.iter().filter_map(Operand::as_node) {
            assert!(
                self.contains(id),
                "add_node({name}): operand {id} is not part of the graph",
            );
        }
    }

    fn make_node(&mut self, kind: OpKind, operands: Vec<Operand>, name: &str) -> Node {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        Node {
            id,
            name: self.unique_name(name),
            kind,
            operands,
        }
    }

    /// Returns `base`, or `base_<n>` for the first `n` not already taken.
    pub fn unique_name(&self, base: &str) -> String {
        let taken: HashSet<&str> = self.nodes.iter().map(|n| n.name.as_str()).collect();
        if !taken.contains(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{base}_{i}"))
            .find(|candidate| !taken.contains(candidate.as_str()))
            .unwrap_or_else(|| base.to_string())
    }

    /// Returns `base`, or `base_<n>` for the first `n` not already used as a
    /// constant name.
    pub fn unique_constant_name(&self, base: &str) -> String {
        if !self.constants.contains_key(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{base}_{i}"))
            .find(|candidate| !self.constants.contains_key(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    /// Nodes in graph order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Node with the given id.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Mutable node with the given id.
    ///
    /// Edits are not validated until the next [`commit`](Self::commit).
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.dirty = true;
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    /// Node with the given name.
    pub fn find_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Index of `id` in graph order.
    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    /// Returns `true` if `id` is a live node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.position(id).is_some()
    }

    /// Placeholder nodes in graph order.
    pub fn placeholders(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.kind == OpKind::Placeholder)
            .map(|n| n.id)
            .collect()
    }

    /// Nodes that use `id` as an operand, in graph order.
    pub fn users(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.uses(id))
            .map(|n| n.id)
            .collect()
    }

    /// Returns `true` if `id` is a graph output.
    pub fn is_output(&self, id: NodeId) -> bool {
        self.outputs.contains(&id)
    }

    /// Constant tensor stored under `name`.
    pub fn constant(&self, name: &str) -> Option<&Tensor> {
        self.constants.get(name)
    }

    /// Replaces operand `index` of node `id`.
    pub fn set_operand(
        &mut self,
        id: NodeId,
        index: usize,
        operand: Operand,
    ) -> Result<(), IrError> {
        let node = self.node_mut(id).ok_or(IrError::UnknownNode(id))?;
        let len = node.operands.len();
        let slot = node
            .operands
            .get_mut(index)
            .ok_or_else(|| IrError::OperandOutOfRange {
                node: node.name.clone(),
                index,
                len,
            })?;
        *slot = operand;
        Ok(())
    }

    /// Redirects every use of `old` (operands and graph outputs) to `new`.
    ///
    /// Quantization annotations of the redirected users are re-keyed as well, so
    /// no annotation is left pointing at `old` through an operand edge. `new`
    /// itself is not rewritten. Returns the number of rewritten uses.
    pub fn replace_all_uses(&mut self, old: NodeId, new: NodeId) -> usize {
        let mut count = 0;
        let mut rewired = Vec::new();
        for node in self.nodes.iter_mut().filter(|n| n.id != new) {
            let mut touched = false;
            for operand in &mut node.operands {
                if operand.as_node() == Some(old) {
                    *operand = Operand::Node(new);
                    count += 1;
                    touched = true;
                }
            }
            if touched {
                rewired.push(node.id);
            }
        }
        for user in rewired {
            self.meta.rekey_input(user, old, new);
        }
        for out in &mut self.outputs {
            if *out == old {
                *out = new;
                count += 1;
            }
        }
        if count > 0 {
            self.dirty = true;
        }
        count
    }

    /// Removes a node that has no remaining users, returning it.
    ///
    /// Its metadata entry is dropped with it.
    pub fn erase_node(&mut self, id: NodeId) -> Result<Node, IrError> {
        let pos = self.position(id).ok_or(IrError::UnknownNode(id))?;
        let mut users = self.users(id);
        if self.is_output(id) {
            users.push(id);
        }
        if !users.is_empty() {
            return Err(IrError::NodeHasUsers {
                node: self.nodes[pos].name.clone(),
                users,
            });
        }
        self.meta.remove(id);
        self.dirty = true;
        Ok(self.nodes.remove(pos))
    }

    /// Removes nodes whose values are never used.
    ///
    /// Placeholders and opaque operators are always kept. Returns `true` if
    /// anything was removed.
    pub fn eliminate_dead_code(&mut self) -> bool {
        let mut live: HashSet<NodeId> = self.outputs.iter().copied().collect();
        let mut keep = vec![false; self.nodes.len()];

        // Users always come after their operands, so one reverse sweep suffices.
        for (i, node) in self.nodes.iter().enumerate().rev() {
            let pinned = matches!(node.kind, OpKind::Placeholder | OpKind::Opaque { .. });
            if pinned || live.contains(&node.id) {
                keep[i] = true;
                live.extend(node.node_operands());
            }
        }

        let dead: Vec<NodeId> = self
            .nodes
            .iter()
            .zip(&keep)
            .filter(|(_, k)| !**k)
            .map(|(n, _)| n.id)
            .collect();
        if dead.is_empty() {
            return false;
        }

        for &id in &dead {
            self.meta.remove(id);
        }
        let mut flags = keep.into_iter();
        self.nodes.retain(|_| flags.next().unwrap_or(true));
        self.dirty = true;
        log::debug!("dead code elimination removed {} node(s)", dead.len());
        true
    }

    /// Checks every structural invariant of the graph.
    ///
    /// * node ids and names are unique;
    /// * every node operand refers to a node placed earlier (acyclicity);
    /// * every constant load names a stored constant;
    /// * every graph output is live;
    /// * metadata exists only for live nodes and every quantization annotation
    ///   is keyed by live nodes.
    pub fn validate(&self) -> Result<(), IrError> {
        let mut seen: HashSet<NodeId> = HashSet::with_capacity(self.nodes.len());
        let mut names: HashSet<&str> = HashSet::with_capacity(self.nodes.len());

        for node in &self.nodes {
            for operand in node.node_operands() {
                if !seen.contains(&operand) {
                    return Err(IrError::OperandNotDominated {
                        node: node.name.clone(),
                        operand,
                    });
                }
            }
            if let OpKind::GetAttr { target } = &node.kind
                && !self.constants.contains_key(target)
            {
                return Err(IrError::UnknownConstant {
                    node: node.name.clone(),
                    target: target.clone(),
                });
            }
            if !seen.insert(node.id) {
                return Err(IrError::DuplicateNode(node.id));
            }
            if !names.insert(node.name.as_str()) {
                return Err(IrError::DuplicateName(node.name.clone()));
            }
        }

        if let Some(&out) = self.outputs.iter().find(|o| !seen.contains(o)) {
            return Err(IrError::DanglingOutput(out));
        }

        for (id, meta) in self.meta.iter() {
            let Some(node) = self.node(id) else {
                return Err(IrError::OrphanMetadata(id));
            };
            if let Some(ann) = &meta.quantization
                && let Some(key) = ann.input_keys().find(|k| !seen.contains(k))
            {
                return Err(IrError::StaleAnnotationKey {
                    node: node.name.clone(),
                    key,
                });
            }
        }

        Ok(())
    }

    /// Ends a mutation phase: validates the graph and marks it clean.
    pub fn commit(&mut self) -> Result<(), IrError> {
        self.validate()?;
        self.dirty = false;
        log::debug!(
            "committed graph: {} node(s), {} constant(s), {} output(s)",
            self.nodes.len(),
            self.constants.len(),
            self.outputs.len()
        );
        Ok(())
    }

    /// Returns `true` if the graph was mutated since the last [`commit`](Self::commit).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}
