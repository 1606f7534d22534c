//! Per-node metadata side-table.
//!
//! Metadata lives outside the nodes themselves, keyed by [`NodeId`]. The only
//! entry the passes interpret is the [`QuantAnnotation`]; provenance and
//! free-form `extra` entries are opaque and copied verbatim.

use std::collections::BTreeMap;

use crate::graph::NodeId;
use crate::types::{Scalar, TensorMeta};

/// How a quantization spec's parameters are shared across a tensor.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum QuantGranularity {
    /// One scale / zero-point for the whole tensor.
    PerTensor,
    /// One scale / zero-point per slice along `axis`.
    PerChannel { axis: usize },
}

/// Affine quantization parameters for one operand.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantSpec {
    /// Scale(s); a single entry for per-tensor specs.
    pub scale: Vec<f32>,
    /// Zero point(s); a single entry for per-tensor specs.
    pub zero_point: Vec<i32>,
    /// Quantized element type.
    pub dtype: Scalar,
    /// Smallest representable quantized value.
    pub quant_min: i64,
    /// Largest representable quantized value.
    pub quant_max: i64,
    pub granularity: QuantGranularity,
}

impl QuantSpec {
    /// Default activation spec: int8, asymmetric range `[-128, 127]`, per tensor.
    pub fn activation(scale: f32, zero_point: i32) -> Self {
        Self {
            scale: vec![scale],
            zero_point: vec![zero_point],
            dtype: Scalar::I8,
            quant_min: -128,
            quant_max: 127,
            granularity: QuantGranularity::PerTensor,
        }
    }

    /// Default per-tensor weight spec: int8, symmetric range `[-127, 127]`.
    pub fn weight(scale: f32) -> Self {
        Self {
            scale: vec![scale],
            zero_point: vec![0],
            dtype: Scalar::I8,
            quant_min: -127,
            quant_max: 127,
            granularity: QuantGranularity::PerTensor,
        }
    }

    /// Default per-channel weight spec along `axis`.
    pub fn weight_per_channel(scales: Vec<f32>, axis: usize) -> Self {
        let zero_point = vec![0; scales.len()];
        Self {
            scale: scales,
            zero_point,
            dtype: Scalar::I8,
            quant_min: -127,
            quant_max: 127,
            granularity: QuantGranularity::PerChannel { axis },
        }
    }

    /// Bias spec: int32 with a per-tensor scale.
    pub fn bias(scale: f32) -> Self {
        Self {
            scale: vec![scale],
            zero_point: vec![0],
            dtype: Scalar::I32,
            quant_min: i32::MIN as i64,
            quant_max: i32::MAX as i64,
            granularity: QuantGranularity::PerTensor,
        }
    }
}

/// How a node's operands and result should be quantized.
///
/// `input_qspec_map` keeps insertion order, which for a convolution is
/// activation, weight, bias.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuantAnnotation {
    input_qspec_map: Vec<(NodeId, QuantSpec)>,
    /// Spec applied to the node's result, if any.
    pub output_qspec: Option<QuantSpec>,
    /// Set once an annotator has claimed the node.
    pub annotated: bool,
}

impl QuantAnnotation {
    /// Creates an empty, claimed annotation.
    pub fn new() -> Self {
        Self {
            annotated: true,
            ..Self::default()
        }
    }

    /// Builder-style [`insert_input`](Self::insert_input).
    pub fn with_input(mut self, operand: NodeId, spec: QuantSpec) -> Self {
        self.insert_input(operand, spec);
        self
    }

    /// Builder-style setter for the output spec.
    pub fn with_output(mut self, spec: QuantSpec) -> Self {
        self.output_qspec = Some(spec);
        self
    }

    /// Sets the spec for `operand`, keeping its position if already present.
    pub fn insert_input(&mut self, operand: NodeId, spec: QuantSpec) {
        match self.input_qspec_map.iter_mut().find(|(k, _)| *k == operand) {
            Some(entry) => entry.1 = spec,
            None => self.input_qspec_map.push((operand, spec)),
        }
    }

    /// Spec recorded for `operand`.
    pub fn input_spec(&self, operand: NodeId) -> Option<&QuantSpec> {
        self.input_qspec_map
            .iter()
            .find(|(k, _)| *k == operand)
            .map(|(_, s)| s)
    }

    /// Operand keys in insertion order.
    pub fn input_keys(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.input_qspec_map.iter().map(|(k, _)| *k)
    }

    /// `(operand, spec)` entries in insertion order.
    pub fn inputs(&self) -> &[(NodeId, QuantSpec)] {
        &self.input_qspec_map
    }

    /// Number of input specs.
    pub fn input_count(&self) -> usize {
        self.input_qspec_map.len()
    }

    /// Replaces every key equal to `old` with `new`.
    ///
    /// If `new` already has an entry the `old` entry is dropped, so keys stay
    /// unique. Returns `true` if anything changed.
    pub fn rekey(&mut self, old: NodeId, new: NodeId) -> bool {
        let Some(pos) = self.input_qspec_map.iter().position(|(k, _)| *k == old) else {
            return false;
        };
        if self.input_qspec_map.iter().any(|(k, _)| *k == new) {
            self.input_qspec_map.remove(pos);
        } else {
            self.input_qspec_map[pos].0 = new;
        }
        true
    }

    /// Re-keys the specs, in insertion order, onto `operands`.
    ///
    /// Specs beyond `operands.len()` are returned instead of being kept.
    pub fn rekeyed_onto(&self, operands: &[NodeId]) -> (Self, Vec<QuantSpec>) {
        let mut rebuilt = Self {
            input_qspec_map: Vec::with_capacity(operands.len()),
            output_qspec: self.output_qspec.clone(),
            annotated: self.annotated,
        };
        let mut dropped = Vec::new();
        for (i, (_, spec)) in self.input_qspec_map.iter().enumerate() {
            match operands.get(i) {
                Some(&key) => rebuilt.insert_input(key, spec.clone()),
                None => dropped.push(spec.clone()),
            }
        }
        (rebuilt, dropped)
    }
}

/// Metadata attached to a single node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeMeta {
    /// Source provenance (e.g. a stack trace of the defining call).
    pub stack_trace: Option<String>,
    /// Traced shape / dtype of the node's value.
    pub tensor: Option<TensorMeta>,
    /// Quantization annotation.
    pub quantization: Option<QuantAnnotation>,
    /// Opaque pass-through entries.
    pub extra: BTreeMap<String, String>,
}

impl NodeMeta {
    /// Copy of this entry without its quantization annotation.
    pub fn without_quantization(&self) -> Self {
        Self {
            stack_trace: self.stack_trace.clone(),
            tensor: self.tensor.clone(),
            quantization: None,
            extra: self.extra.clone(),
        }
    }
}

/// Side-table mapping node ids to their metadata.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetaTable {
    entries: BTreeMap<NodeId, NodeMeta>,
}

impl MetaTable {
    /// Metadata for `node`, if any was recorded.
    pub fn get(&self, node: NodeId) -> Option<&NodeMeta> {
        self.entries.get(&node)
    }

    /// Mutable metadata for `node`, if any was recorded.
    pub fn get_mut(&mut self, node: NodeId) -> Option<&mut NodeMeta> {
        self.entries.get_mut(&node)
    }

    /// Metadata for `node`, created empty if missing.
    pub fn entry(&mut self, node: NodeId) -> &mut NodeMeta {
        self.entries.entry(node).or_default()
    }

    /// Replaces the metadata of `node`.
    pub fn insert(&mut self, node: NodeId, meta: NodeMeta) {
        self.entries.insert(node, meta);
    }

    /// Removes and returns the metadata of `node`.
    pub fn remove(&mut self, node: NodeId) -> Option<NodeMeta> {
        self.entries.remove(&node)
    }

    /// Quantization annotation of `node`.
    pub fn annotation(&self, node: NodeId) -> Option<&QuantAnnotation> {
        self.entries.get(&node)?.quantization.as_ref()
    }

    /// Attaches a quantization annotation to `node`.
    pub fn set_annotation(&mut self, node: NodeId, annotation: QuantAnnotation) {
        self.entry(node).quantization = Some(annotation);
    }

    /// Re-keys the annotation of `user` from `old` to `new`.
    pub fn rekey_input(&mut self, user: NodeId, old: NodeId, new: NodeId) -> bool {
        self.entries
            .get_mut(&user)
            .and_then(|m| m.quantization.as_mut())
            .is_some_and(|q| q.rekey(old, new))
    }

    /// Iterates over `(node, meta)` entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &NodeMeta)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    /// Number of nodes with metadata.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no metadata was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
