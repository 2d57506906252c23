use crate::core::types::{Input, TensorRef};
use crate::error::{GraphError, PipelineError};
use crate::graph::{Graph, Node};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Segments that were unfused, in graph order.
    pub restored: Vec<String>,
    /// `(node, input)` pairs dropped because the input no longer resolves.
    pub dropped_inputs: Vec<(String, String)>,
}

/// Splices every segment without an artifact back into `graph`.
///
/// `original_controls` is the `node -> control sources` index captured
/// before partitioning; restored nodes get their control inputs back from
/// it. A control source that was itself fused into a compiled segment is
/// redirected to that segment.
pub fn restore_compiler_failures(
    graph: &mut Graph,
    original_controls: &BTreeMap<String, Vec<String>>,
) -> Result<RecoveryReport, GraphError> {
    let mut report = RecoveryReport::default();
    let failed: HashSet<String> = graph
        .nodes()
        .iter()
        .filter(|n| n.segment.as_deref().is_some_and(|s| !s.is_compiled()))
        .map(|n| n.name.clone())
        .collect();
    if failed.is_empty() {
        return Ok(report);
    }

    let mut member_of: HashMap<String, String> = HashMap::new();
    let mut seg_outputs: HashMap<TensorRef, TensorRef> = HashMap::new();
    for node in graph.nodes() {
        let Some(segment) = node.segment.as_deref() else { continue };
        if failed.contains(&node.name) {
            for (j, internal) in segment.output_names.iter().enumerate() {
                seg_outputs.insert(TensorRef::new(node.name.clone(), j), internal.clone());
            }
        } else {
            let boundary: HashSet<&str> = segment.input_names.iter().map(|t| t.node.as_str()).collect();
            for inner in segment.graph.nodes().iter().filter(|n| !boundary.contains(n.name.as_str())) {
                member_of.insert(inner.name.clone(), node.name.clone());
            }
        }
    }
    let resolve = |t: &TensorRef| seg_outputs.get(t).cloned().unwrap_or_else(|| t.clone());

    let mut nodes: Vec<Node> = Vec::with_capacity(graph.len());
    let mut restored_names: Vec<String> = Vec::new();
    for node in graph.nodes() {
        if !failed.contains(&node.name) {
            let mut node = node.clone();
            for input in &mut node.inputs {
                if let Input::Data(t) = input {
                    *t = resolve(t);
                }
            }
            nodes.push(node);
            continue;
        }
        let Some(segment) = node.segment.as_deref() else { continue };
        let externals: Vec<TensorRef> = node.data_inputs().map(&resolve).collect();
        let placeholder_of: HashMap<&TensorRef, &TensorRef> = segment.input_names.iter().zip(&externals).collect();
        let boundary: HashSet<&str> = segment.input_names.iter().map(|t| t.node.as_str()).collect();

        for inner in segment.graph.nodes() {
            if boundary.contains(inner.name.as_str()) {
                continue;
            }
            let mut restored = inner.clone();
            restored.inputs = restored
                .inputs
                .into_iter()
                .filter(|i| !i.is_control())
                .map(|i| match i {
                    Input::Data(t) => Input::Data(placeholder_of.get(&t).map_or(t.clone(), |e| (*e).clone())),
                    control => control,
                })
                .collect();
            restored_names.push(restored.name.clone());
            nodes.push(restored);
        }
        debug!(segment = %node.name, nodes = segment.graph.len() - boundary.len(), "unfusing segment");
        report.restored.push(node.name.clone());
    }

    let present: HashSet<String> = nodes.iter().map(|n| n.name.clone()).collect();
    let restored_set: HashSet<&str> = restored_names.iter().map(String::as_str).collect();
    for node in nodes.iter_mut().filter(|n| restored_set.contains(n.name.as_str())) {
        let Some(controls) = original_controls.get(&node.name) else { continue };
        for source in controls {
            let target = if present.contains(source) {
                Some(source.clone())
            } else {
                member_of.get(source).cloned()
            };
            match target {
                Some(t) if !node.inputs.iter().any(|i| i.is_control() && i.node_name() == t) => {
                    node.inputs.push(Input::Control(t))
                }
                Some(_) => {}
                None => report.dropped_inputs.push((node.name.clone(), format!("^{source}"))),
            }
        }
    }

    for node in &mut nodes {
        let name = node.name.clone();
        node.inputs.retain(|i| {
            let keep = present.contains(i.node_name());
            if !keep {
                report.dropped_inputs.push((name.clone(), i.to_string()));
            }
            keep
        });
    }
    for (node, input) in &report.dropped_inputs {
        warn!(node = %node, input = %input, "dropping input that no longer resolves");
    }

    let mut rebuilt = Graph::from_nodes(nodes)?;
    rebuilt.versions = graph.versions.take();
    rebuilt.library = graph.library.take();
    rebuilt.legacy_version = graph.legacy_version;
    *graph = rebuilt;

    info!(segments = ?report.restored, "restored segments that failed to compile");
    Ok(report)
}

/// Fails naming every segment that still lacks an artifact.
pub fn ensure_compiled(graph: &Graph) -> Result<(), PipelineError> {
    let segments: Vec<String> = graph
        .nodes()
        .iter()
        .filter(|n| n.segment.as_deref().is_some_and(|s| !s.is_compiled()))
        .map(|n| n.name.clone())
        .collect();
    if segments.is_empty() { Ok(()) } else { Err(PipelineError::Uncompiled { segments }) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::op::OpKind;
    use crate::core::types::DataType;
    use crate::graph::AttrValue;
    use crate::partitioner::{PartitionConfig, whitelist_partition};

    fn f32_node(name: &str, op: OpKind, inputs: &[&str]) -> Node {
        Node::new(name, op).with_inputs(inputs).unwrap().with_attr("T", AttrValue::Type(DataType::F32))
    }

    fn config(ops: &[&str]) -> PartitionConfig {
        PartitionConfig {
            op_whitelist: ops.iter().map(|s| s.to_string()).collect(),
            minimum_segment_size: Some(2),
            ..Default::default()
        }
    }

    fn mark_compiled(graph: &mut Graph, name: &str) {
        if let Some(seg) = graph.node_mut(name).and_then(|n| n.segment.as_deref_mut()) {
            seg.executable = Some(vec![1]);
        }
    }

    #[test]
    fn uncompiled_partition_roundtrips_to_original() {
        let original = Graph::from_nodes(vec![
            Node::new("a", OpKind::Placeholder).with_attr("dtype", AttrValue::Type(DataType::F32)),
            f32_node("init", OpKind::Relu, &["a"]),
            f32_node("b", OpKind::Add, &["a", "a", "^init"]),
            f32_node("c", OpKind::Relu, &["b"]),
            f32_node("cut", OpKind::Other("Erf".into()), &["c", "b"]),
            f32_node("d", OpKind::Relu, &["cut"]),
            f32_node("e", OpKind::Tanh, &["d"]),
            f32_node("f", OpKind::Identity, &["e", "c"]),
        ])
        .unwrap();
        let mut g = original.clone();
        let partition = whitelist_partition(&mut g, &config(&["Add", "Relu", "Tanh"])).unwrap();
        assert_eq!(partition.segments.len(), 2);

        let report = restore_compiler_failures(&mut g, &partition.original_controls).unwrap();
        assert_eq!(report.restored.len(), 2);
        assert!(report.dropped_inputs.is_empty());
        assert!(ensure_compiled(&g).is_ok());
        assert_eq!(g, original);
    }

    #[test]
    fn only_failed_segments_are_unfused() {
        let original = Graph::from_nodes(vec![
            Node::new("a", OpKind::Placeholder).with_attr("dtype", AttrValue::Type(DataType::F32)),
            f32_node("p1", OpKind::Relu, &["a"]),
            f32_node("p2", OpKind::Relu, &["p1"]),
            f32_node("cut", OpKind::Other("Erf".into()), &["p2"]),
            f32_node("q1", OpKind::Relu, &["cut"]),
            f32_node("q2", OpKind::Relu, &["q1"]),
        ])
        .unwrap();
        let mut g = original.clone();
        let partition = whitelist_partition(&mut g, &config(&["Relu"])).unwrap();
        mark_compiled(&mut g, "segment_0");

        let report = restore_compiler_failures(&mut g, &partition.original_controls).unwrap();
        assert_eq!(report.restored, vec!["segment_1".to_string()]);
        assert!(g.contains("segment_0"));
        assert!(g.contains("q1") && g.contains("q2"));
        assert_eq!(g.node("q1").unwrap().data_inputs().next(), Some(&TensorRef::new("cut", 0)));
        assert_eq!(g.node("cut").unwrap().data_inputs().next(), Some(&TensorRef::new("segment_0", 0)));
        g.validate().unwrap();
        assert!(g.is_acyclic());
    }

    #[test]
    fn control_on_fused_source_moves_to_segment() {
        // q1 waits on p2, which now lives inside a compiled segment.
        let mut g = Graph::from_nodes(vec![
            Node::new("a", OpKind::Placeholder),
            Node::new("seg_ok", OpKind::FusedSegment).with_inputs(&["a"]).unwrap(),
            Node::new("seg_bad", OpKind::FusedSegment).with_inputs(&["a"]).unwrap(),
            Node::new("out", OpKind::Identity).with_inputs(&["seg_bad"]).unwrap(),
        ])
        .unwrap();
        let ok_graph = Graph::from_nodes(vec![
            Node::new("seg_ok/placeholder_0", OpKind::Placeholder),
            Node::new("p2", OpKind::Relu).with_inputs(&["seg_ok/placeholder_0"]).unwrap(),
        ])
        .unwrap();
        let bad_graph = Graph::from_nodes(vec![
            Node::new("seg_bad/placeholder_0", OpKind::Placeholder),
            Node::new("q1", OpKind::Relu).with_inputs(&["seg_bad/placeholder_0"]).unwrap(),
        ])
        .unwrap();
        let segment = |graph: Graph, ph: &str, out: &str, artifact: Option<Vec<u8>>| {
            Some(Box::new(crate::segment::FusedSegment {
                graph,
                input_names: vec![TensorRef::new(ph, 0)],
                output_names: vec![TensorRef::new(out, 0)],
                executable: artifact,
                ..Default::default()
            }))
        };
        g.node_mut("seg_ok").unwrap().segment = segment(ok_graph, "seg_ok/placeholder_0", "p2", Some(vec![1]));
        g.node_mut("seg_bad").unwrap().segment = segment(bad_graph, "seg_bad/placeholder_0", "q1", None);

        let controls = BTreeMap::from([("q1".to_string(), vec!["p2".to_string(), "gone".to_string()])]);
        let report = restore_compiler_failures(&mut g, &controls).unwrap();
        let q1 = g.node("q1").unwrap();
        assert_eq!(q1.inputs.iter().map(|i| i.to_string()).collect::<Vec<_>>(), vec!["a", "^seg_ok"]);
        assert_eq!(report.dropped_inputs, vec![("q1".to_string(), "^gone".to_string())]);
        assert_eq!(g.node("out").unwrap().data_inputs().next(), Some(&TensorRef::new("q1", 0)));
    }

    #[test]
    fn uncompiled_segments_are_named() {
        let mut g = Graph::from_nodes(vec![Node::new("s", OpKind::FusedSegment)]).unwrap();
        g.node_mut("s").unwrap().segment = Some(Box::default());
        assert_eq!(ensure_compiled(&g), Err(PipelineError::Uncompiled { segments: vec!["s".to_string()] }));
    }
}
