//! Batch-axis annotation of compiled segments. A segment whose inputs and
//! outputs all keep a free leading dimension can be run with any batch size.

use crate::core::op::OpKind;
use crate::core::types::{Dim, Shape, TensorRef};
use crate::graph::{AttrValue, Graph, Node};
use crate::segment::{FusedSegment, source_tensor};
use crate::shape_inference::ShapeMap;
use crate::tensor_util;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Axis value meaning "no batch axis".
pub const NO_BATCH_AXIS: i64 = -1;

/// A leading dimension the runtime may vary: unknown rank, or a non-scalar
/// shape whose first dimension is unknown.
fn has_free_batch(shape: &Shape) -> bool {
    match &shape.dims {
        None => true,
        Some(dims) => dims.first() == Some(&Dim::Unknown),
    }
}

fn batch_axis(shape: &Shape) -> i64 {
    if has_free_batch(shape) { 0 } else { NO_BATCH_AXIS }
}

/// Declared shapes of one segment's tensors. Sub-graph placeholders resolve
/// to the tensors they stand in for.
struct SegmentShapes<'a> {
    declared: &'a ShapeMap,
    aliases: HashMap<TensorRef, TensorRef>,
}

impl<'a> SegmentShapes<'a> {
    fn new(graph: &Graph, node: &Node, segment: &FusedSegment, declared: &'a ShapeMap) -> Self {
        let aliases = segment
            .input_names
            .iter()
            .cloned()
            .zip(node.data_inputs().map(|t| source_tensor(graph, t)))
            .collect();
        Self { declared, aliases }
    }

    fn shape(&self, t: &TensorRef) -> Shape {
        self.declared.shape(self.aliases.get(t).unwrap_or(t))
    }

    fn axes(&self, names: &[TensorRef]) -> Vec<i64> {
        names.iter().map(|t| batch_axis(&self.shape(t))).collect()
    }
}

/// Integer values of a `Const` node inside `graph`.
fn const_ints(graph: &Graph, t: &TensorRef) -> Option<Vec<i64>> {
    let node = graph.node(&t.node)?;
    if node.op != OpKind::Const {
        return None;
    }
    let proto = node.attr("value").and_then(AttrValue::as_tensor)?;
    Some(tensor_util::value_from_proto(proto)?.as_i64s())
}

/// True when `axes` is a non-empty list of axes that never names axis 0.
fn keeps_axis_zero(axes: Option<Vec<i64>>, rank: Option<usize>) -> bool {
    let Some(axes) = axes.filter(|a| !a.is_empty()) else { return false };
    axes.iter().all(|&a| match (a, rank) {
        (0, _) => false,
        (a, _) if a > 0 => true,
        (a, Some(r)) => a + r as i64 != 0,
        (_, None) => false,
    })
}

fn is_pseudo_unary(op: &OpKind) -> bool {
    matches!(op, OpKind::BiasAdd | OpKind::FusedBatchNorm | OpKind::FusedBatchNormV3)
        || matches!(
            op.as_str(),
            "Pad"
                | "PadV2"
                | "ClipByValue"
                | "AvgPool"
                | "AvgPool3D"
                | "Conv2D"
                | "Conv3D"
                | "DepthwiseConv2dNative"
                | "Dilation2D"
                | "FusedBatchNormV2"
                | "MaxPool"
                | "MaxPoolV2"
                | "MaxPool3D"
        )
}

/// Inputs of `node` whose free batch dimension carries over to every
/// output. Empty when the op does not preserve the batch dimension.
fn batch_preserving_inputs(sub: &Graph, node: &Node, shapes: &SegmentShapes<'_>) -> Vec<TensorRef> {
    let data: Vec<TensorRef> = node.data_inputs().cloned().collect();
    let op = &node.op;
    if op.is_unary_elementwise() {
        return data.into_iter().take(1).collect();
    }
    if op.is_binary_broadcast() {
        let [a, b] = data.as_slice() else { return Vec::new() };
        let (sa, sb) = (shapes.shape(a), shapes.shape(b));
        return match (sa.rank(), sb.rank()) {
            (Some(ra), Some(rb)) if ra > rb => vec![a.clone()],
            (Some(ra), Some(rb)) if ra < rb => vec![b.clone()],
            (Some(_), Some(_)) => [(a, &sa), (b, &sb)]
                .into_iter()
                .filter(|(_, s)| s.rank() != Some(0) && has_free_batch(s))
                .map(|(t, _)| t.clone())
                .collect(),
            _ => Vec::new(),
        };
    }
    if op.is_reduction() || matches!(op.as_str(), "ArgMax" | "ArgMin" | "EuclideanNorm") {
        let Some((axis, rest)) = data.split_last() else { return Vec::new() };
        let rank = rest.first().and_then(|t| shapes.shape(t).rank());
        return if keeps_axis_zero(const_ints(sub, axis), rank) { rest.to_vec() } else { Vec::new() };
    }
    if is_pseudo_unary(op) {
        return data.into_iter().take(1).collect();
    }
    if *op == OpKind::ConcatV2 {
        let Some((axis, rest)) = data.split_last() else { return Vec::new() };
        let rank = rest.first().and_then(|t| shapes.shape(t).rank());
        return if keeps_axis_zero(const_ints(sub, axis), rank) { rest.to_vec() } else { Vec::new() };
    }
    if *op == OpKind::MatMul && !node.attr_bool("transpose_a").unwrap_or(false) {
        return data.into_iter().take(1).collect();
    }
    Vec::new()
}

/// Whether every input and output of the segment keeps a free batch
/// dimension, following it through the sub-graph op by op.
fn segment_supports_dynamic_batch(graph: &Graph, node: &Node, segment: &FusedSegment, declared: &ShapeMap) -> bool {
    let shapes = SegmentShapes::new(graph, node, segment, declared);
    let sub = &segment.graph;
    let Ok(order) = sub.topo_order() else { return false };

    let free_inputs: HashSet<&TensorRef> =
        segment.input_names.iter().filter(|t| has_free_batch(&shapes.shape(t))).collect();
    // Nodes whose every output keeps the free batch dimension.
    let mut dynamic_nodes: HashSet<&str> = HashSet::new();
    let is_dynamic =
        |t: &TensorRef, nodes: &HashSet<&str>| free_inputs.contains(t) || nodes.contains(t.node.as_str());
    for i in order {
        let op_node = &sub.nodes()[i];
        let inputs = batch_preserving_inputs(sub, op_node, &shapes);
        if !inputs.is_empty() && inputs.iter().all(|t| is_dynamic(t, &dynamic_nodes)) {
            dynamic_nodes.insert(op_node.name.as_str());
        }
    }
    let enabled =
        segment.input_names.iter().chain(&segment.output_names).all(|t| is_dynamic(t, &dynamic_nodes));
    debug!(segment = %node.name, enabled, "dynamic batch check");
    enabled
}

/// Sets both batch-axis lists of every fused node from the declared shapes
/// of its boundary tensors. Returns how many segments were annotated.
pub fn run_mark_batch_axis(graph: &mut Graph, declared: &ShapeMap) -> usize {
    let mut updates: Vec<(String, Vec<i64>, Vec<i64>)> = Vec::new();
    for node in graph.nodes() {
        let Some(segment) = node.segment.as_deref() else { continue };
        let shapes = SegmentShapes::new(graph, node, segment, declared);
        updates.push((node.name.clone(), shapes.axes(&segment.input_names), shapes.axes(&segment.output_names)));
    }
    let count = updates.len();
    for (name, inputs, outputs) in updates {
        if let Some(segment) = graph.node_mut(&name).and_then(|n| n.segment.as_deref_mut()) {
            segment.input_batch_axis = inputs;
            segment.output_batch_axis = outputs;
        }
    }
    count
}

/// Fills every fused node's batch-axis lists with [`NO_BATCH_AXIS`].
pub fn run_clear_batch_axis(graph: &mut Graph) {
    for node in graph.nodes_mut() {
        if let Some(segment) = node.segment.as_deref_mut() {
            segment.input_batch_axis = vec![NO_BATCH_AXIS; segment.input_names.len()];
            segment.output_batch_axis = vec![NO_BATCH_AXIS; segment.output_names.len()];
        }
    }
}

/// Enables a dynamic batch size when every fused node supports one, and
/// marks batch axes in that case. Otherwise every segment gets
/// [`NO_BATCH_AXIS`] lists. Returns whether the graph became dynamic.
pub fn run_set_dynamic_batch_size(graph: &mut Graph, declared: &ShapeMap) -> bool {
    let mut segments = 0;
    let mut all_enabled = true;
    for node in graph.nodes() {
        let Some(segment) = node.segment.as_deref() else { continue };
        segments += 1;
        if !segment_supports_dynamic_batch(graph, node, segment, declared) {
            all_enabled = false;
            break;
        }
    }
    let dynamic = segments > 0 && all_enabled;
    if dynamic {
        run_mark_batch_axis(graph, declared);
        info!(segments, "dynamic batch size enabled");
    } else {
        run_clear_batch_axis(graph);
    }
    dynamic
}

/// Frees dimension 0 of every placeholder once any fused node takes a
/// batched input. Returns how many placeholders changed.
pub fn run_relax_placeholder_shapes(graph: &mut Graph) -> usize {
    let batched = graph
        .nodes()
        .iter()
        .filter_map(|n| n.segment.as_deref())
        .any(|s| s.input_batch_axis.iter().any(|&a| a != NO_BATCH_AXIS));
    if !batched {
        return 0;
    }
    let mut relaxed = 0;
    for node in graph.nodes_mut() {
        if node.op != OpKind::Placeholder {
            continue;
        }
        let Some(AttrValue::Shape(shape)) = node.attrs.get_mut("shape") else { continue };
        if let Some(first) = shape.dims.as_mut().and_then(|d| d.first_mut()) {
            if *first != Dim::Unknown {
                *first = Dim::Unknown;
                relaxed += 1;
            }
        }
    }
    relaxed
}
