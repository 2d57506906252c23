use crate::core::op::OpKind;
use crate::core::types::{DataType, Input, Shape, TensorRef, TensorValue};
use crate::error::GraphError;
use crate::graph::{AttrValue, ConsumerIndex, Graph};
use crate::shape_inference::ShapeMap;
use crate::tensor_util;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

/// Rewrites operator variants into the forms the compiler accepts.
/// Returns how many nodes changed.
pub fn run_normalize_operators(graph: &mut Graph) -> usize {
    let index = ConsumerIndex::build(graph);
    let recorded: HashMap<TensorRef, Shape> = graph
        .nodes()
        .iter()
        .flat_map(|n| {
            let shapes = n.attr("_output_shapes").and_then(AttrValue::as_list).map(|l| l.shapes.clone());
            shapes
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .map(move |(port, s)| (TensorRef::new(n.name.clone(), port), s))
        })
        .collect();

    let mut rewrites: Vec<(String, OpKind)> = Vec::new();
    for node in graph.nodes() {
        let target = match node.op {
            OpKind::StopGradient => Some(OpKind::Identity),
            OpKind::AddV2 => Some(OpKind::Add),
            OpKind::FusedBatchNormV3 => {
                let float = node.attr_type("T").is_some_and(DataType::is_float);
                let reserve_unused = index.consumed_ports(&node.name).iter().all(|&p| p < 3);
                (float && reserve_unused).then_some(OpKind::FusedBatchNorm)
            }
            OpKind::BatchMatMulV2 => {
                let shapes: Vec<Option<&Vec<_>>> = node
                    .data_inputs()
                    .take(2)
                    .map(|t| recorded.get(t).and_then(|s| s.dims.as_ref()))
                    .collect();
                match shapes.as_slice() {
                    [Some(a), Some(b)] if a.len() == b.len() && a.len() >= 2 => {
                        let batch = a.len() - 2;
                        (a[..batch] == b[..batch]).then_some(OpKind::BatchMatMul)
                    }
                    _ => None,
                }
            }
            _ => None,
        };
        if let Some(op) = target {
            rewrites.push((node.name.clone(), op));
        }
    }

    for (name, op) in &rewrites {
        let Some(node) = graph.node_mut(name) else { continue };
        if node.op == OpKind::FusedBatchNormV3 {
            node.attrs.remove("U");
            if let Some(AttrValue::List(list)) = node.attrs.get_mut("_output_shapes") {
                list.shapes.pop();
            }
        }
        debug!(node = %name, from = %node.op, to = %op, "normalized operator");
        node.op = op.clone();
    }
    rewrites.len()
}

/// Replaces `Shape` and `Size` nodes whose input is fully shaped with
/// constants. Control inputs are kept.
pub fn run_fold_shape_ops(graph: &mut Graph, shapes: &ShapeMap) -> usize {
    let mut folded = Vec::new();
    for node in graph.nodes() {
        if !matches!(node.op, OpKind::Shape | OpKind::Size) {
            continue;
        }
        let Some(input) = node.data_inputs().next() else { continue };
        let Some(dims) = shapes.shape(input).as_static() else { continue };
        let dtype = node.attr_type("out_type").unwrap_or(DataType::I32);
        let value = if node.op == OpKind::Shape {
            TensorValue::ints(dtype, vec![dims.len()], dims.iter().map(|&d| d as i64).collect())
        } else {
            TensorValue::ints(dtype, Vec::new(), vec![dims.iter().product::<usize>() as i64])
        };
        folded.push((node.name.clone(), value));
    }

    for (name, value) in &folded {
        let Some(node) = graph.node_mut(name) else { continue };
        node.op = OpKind::Const;
        node.inputs.retain(Input::is_control);
        node.attrs.retain(|k, _| k.starts_with('_'));
        node.attrs.insert("dtype".to_string(), AttrValue::Type(value.dtype));
        node.attrs.insert("value".to_string(), AttrValue::Tensor(tensor_util::value_to_proto(value)));
    }
    if !folded.is_empty() {
        info!(count = folded.len(), "folded shape ops into constants");
    }
    folded.len()
}

/// The scope prefix shared by most of `names`; ties go to the scope seen
/// first. Names without a scope do not vote.
pub fn most_popular_namescope<'a>(names: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for name in names {
        let Some((scope, _)) = name.rsplit_once('/') else { continue };
        match counts.iter_mut().find(|(s, _)| s == scope) {
            Some((_, n)) => *n += 1,
            None => counts.push((scope.to_string(), 1)),
        }
    }
    let best = counts.iter().map(|(_, n)| *n).max()?;
    counts.into_iter().find(|(_, n)| *n == best).map(|(s, _)| s)
}

/// Moves every fused node under the namescope most of its members share.
/// Returns the applied `old -> new` renames.
pub fn run_rename_by_namescope(graph: &mut Graph) -> Result<BTreeMap<String, String>, GraphError> {
    let mut plan = Vec::new();
    for node in graph.nodes() {
        let Some(segment) = node.segment.as_deref() else { continue };
        let boundary: HashSet<&str> = segment.input_names.iter().map(|t| t.node.as_str()).collect();
        let members = segment.graph.nodes().iter().map(|n| n.name.as_str()).filter(|n| !boundary.contains(n));
        if let Some(scope) = most_popular_namescope(members) {
            plan.push((node.name.clone(), format!("{}/{}", scope, node.name)));
        }
    }

    let mut renamed = BTreeMap::new();
    for (old, new) in plan {
        graph.rename_node(&old, &new)?;
        renamed.insert(old, new);
    }
    Ok(renamed)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub host: usize,
    pub compiled: usize,
}

/// Counts real operations left on the host and those inside compiled
/// segments. Placeholders and segment boundaries are not operations.
pub fn op_counts(graph: &Graph) -> OpCounts {
    let mut counts = OpCounts::default();
    for node in graph.nodes() {
        match node.segment.as_deref() {
            Some(segment) => {
                let boundary: HashSet<&str> = segment.input_names.iter().map(|t| t.node.as_str()).collect();
                counts.compiled += segment.graph.nodes().iter().filter(|n| !boundary.contains(n.name.as_str())).count();
            }
            None if node.op != OpKind::Placeholder => counts.host += 1,
            None => {}
        }
    }
    counts
}

pub fn log_op_counts(graph: &Graph) -> OpCounts {
    let counts = op_counts(graph);
    let total = counts.host + counts.compiled;
    let share = if total == 0 { 0.0 } else { 100.0 * counts.compiled as f64 / total as f64 };
    info!(
        host = counts.host,
        compiled = counts.compiled,
        "{:.1}% of operations placed in compiled segments",
        share
    );
    counts
}
