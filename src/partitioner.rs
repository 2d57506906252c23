use crate::core::op::OpKind;
use crate::core::types::{DataType, Input, Shape, TensorRef};
use crate::error::GraphError;
use crate::graph::{AttrValue, ConsumerIndex, Graph, Node};
use crate::segment::FusedSegment;
use petgraph::unionfind::UnionFind;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct PartitionConfig {
    /// Boundary input tensors; defaults to every Placeholder output.
    pub inputs: Option<Vec<String>>,
    /// Boundary output tensors; defaults to every output of sink nodes.
    pub outputs: Option<Vec<String>>,
    pub op_whitelist: HashSet<String>,
    pub no_fuse_ops: HashSet<String>,
    pub force_fuse_ops: HashSet<String>,
    pub minimum_segment_size: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct PartitionReport {
    pub segments: Vec<String>,
    /// Clusters left unfused for being below the minimum size.
    pub too_small: Vec<Vec<String>>,
    /// Clusters whose contraction would have introduced a cycle.
    pub rejected: Vec<Vec<String>>,
    /// Boundary outputs that now live on a fused node.
    pub output_renames: BTreeMap<TensorRef, TensorRef>,
    /// `node -> control inputs` of the graph before partitioning.
    pub original_controls: BTreeMap<String, Vec<String>>,
}

pub fn default_minimum_segment_size(graph: &Graph) -> usize {
    let ops = graph.nodes().iter().filter(|n| n.op != OpKind::Placeholder).count();
    ops.max(1).min(2)
}

fn parse_tensors(names: &[String]) -> Result<BTreeSet<TensorRef>, GraphError> {
    names.iter().map(|n| TensorRef::parse(n)).collect()
}

fn boundary_inputs(graph: &Graph, config: &PartitionConfig) -> Result<BTreeSet<TensorRef>, GraphError> {
    match &config.inputs {
        Some(names) => parse_tensors(names),
        None => Ok(graph
            .nodes()
            .iter()
            .filter(|n| n.op == OpKind::Placeholder)
            .map(|n| TensorRef::new(n.name.clone(), 0))
            .collect()),
    }
}

fn boundary_outputs(graph: &Graph, index: &ConsumerIndex, config: &PartitionConfig) -> Result<BTreeSet<TensorRef>, GraphError> {
    if let Some(names) = &config.outputs {
        return parse_tensors(names);
    }
    let mut outputs = BTreeSet::new();
    for node in graph.nodes() {
        let ports = index.consumed_ports(&node.name);
        if ports.is_empty() && !index.has_control_consumers(&node.name) {
            let arity = node.attr("_output_shapes").and_then(AttrValue::as_list).map_or(1, |l| l.shapes.len().max(1));
            outputs.extend((0..arity).map(|p| TensorRef::new(node.name.clone(), p)));
        }
    }
    Ok(outputs)
}

fn touches_strings(graph: &Graph, node: &Node, index: &ConsumerIndex) -> bool {
    let consumes = node.data_inputs().any(|t| graph.output_dtype(t) == Some(DataType::Str));
    let produces = index.consumed_ports(&node.name).into_iter().any(|p| node.output_dtype(p) == Some(DataType::Str));
    consumes || produces
}

fn is_eligible(
    graph: &Graph,
    node: &Node,
    index: &ConsumerIndex,
    config: &PartitionConfig,
    input_producers: &HashSet<&str>,
) -> bool {
    if config.no_fuse_ops.contains(&node.name)
        || node.op == OpKind::Placeholder
        || node.is_segment()
        || input_producers.contains(node.name.as_str())
        || index.has_control_consumers(&node.name)
        || touches_strings(graph, node, index)
    {
        return false;
    }
    config.op_whitelist.contains(node.op.as_str()) || config.force_fuse_ops.contains(&node.name)
}

/// Groups eligible nodes into data-connected clusters. Clusters and their
/// members are ordered by first appearance in the graph.
fn clusters(graph: &Graph, eligible: &[bool]) -> Vec<Vec<usize>> {
    let mut uf = UnionFind::<usize>::new(graph.len());
    for (i, node) in graph.nodes().iter().enumerate() {
        if !eligible[i] {
            continue;
        }
        for t in node.data_inputs() {
            if let Some(j) = graph.position(&t.node) {
                if eligible[j] {
                    uf.union(i, j);
                }
            }
        }
    }
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut slot: HashMap<usize, usize> = HashMap::new();
    for i in (0..graph.len()).filter(|&i| eligible[i]) {
        let root = uf.find(i);
        let at = *slot.entry(root).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[at].push(i);
    }
    groups
}

/// True when some path leaves the cluster and re-enters it, so contracting
/// it into one node would close a cycle. Loop back edges are ignored.
fn contraction_creates_cycle(graph: &Graph, index: &ConsumerIndex, members: &HashSet<String>) -> bool {
    let successors = |name: &str| -> Vec<String> {
        let Some(node) = graph.node(name) else { return Vec::new() };
        if node.op == OpKind::NextIteration {
            return Vec::new();
        }
        let mut out: Vec<String> = index
            .consumed_ports(name)
            .into_iter()
            .flat_map(|p| index.consumers(&TensorRef::new(name, p)).to_vec())
            .collect();
        out.extend(index.control_consumers(name).iter().cloned());
        out
    };
    let mut queue: VecDeque<String> = VecDeque::new();
    let mut seen: HashSet<String> = HashSet::new();
    for m in members {
        for next in successors(m) {
            if !members.contains(&next) && seen.insert(next.clone()) {
                queue.push_back(next);
            }
        }
    }
    while let Some(name) = queue.pop_front() {
        for next in successors(&name) {
            if members.contains(&next) {
                return true;
            }
            if seen.insert(next.clone()) {
                queue.push_back(next);
            }
        }
    }
    false
}

fn unique_segment_name(graph: &Graph, next: &mut usize) -> String {
    loop {
        let name = format!("segment_{}", *next);
        *next += 1;
        if !graph.contains(&name) {
            return name;
        }
    }
}

/// Replaces the cluster `members` with one fused node named `name`.
fn contract(
    graph: &mut Graph,
    index: &ConsumerIndex,
    members: &[String],
    name: &str,
    outputs_set: &BTreeSet<TensorRef>,
    report: &mut PartitionReport,
) -> Result<(), GraphError> {
    let member_set: HashSet<&str> = members.iter().map(String::as_str).collect();

    let mut external: Vec<TensorRef> = Vec::new();
    let mut controls: Vec<String> = Vec::new();
    for m in members {
        let node = graph.node(m).ok_or_else(|| GraphError::UnknownNode(m.clone()))?;
        for input in &node.inputs {
            match input {
                Input::Data(t) if !member_set.contains(t.node.as_str()) && !external.contains(t) => {
                    external.push(t.clone())
                }
                Input::Control(src) if !member_set.contains(src.as_str()) && !controls.contains(src) => {
                    controls.push(src.clone())
                }
                _ => {}
            }
        }
    }

    let mut outputs: Vec<TensorRef> = Vec::new();
    for m in members {
        let mut ports: BTreeSet<usize> = index
            .consumed_ports(m)
            .into_iter()
            .filter(|&p| {
                index
                    .consumers(&TensorRef::new(m.clone(), p))
                    .iter()
                    .any(|c| !member_set.contains(c.as_str()))
            })
            .collect();
        ports.extend(outputs_set.iter().filter(|t| &t.node == m).map(|t| t.port));
        outputs.extend(ports.into_iter().map(|p| TensorRef::new(m.clone(), p)));
    }

    let mut sub = Graph::new();
    let mut placeholder_of: HashMap<TensorRef, TensorRef> = HashMap::new();
    let mut input_names = Vec::with_capacity(external.len());
    let mut input_dtypes = Vec::with_capacity(external.len());
    for (i, t) in external.iter().enumerate() {
        let dtype = graph.output_dtype(t).unwrap_or_else(|| {
            warn!(tensor = %t, segment = name, "cannot derive dtype of segment input");
            DataType::Invalid
        });
        let ph = format!("{}/placeholder_{}", name, i);
        sub.add_node(
            Node::new(ph.clone(), OpKind::Placeholder)
                .with_attr("dtype", AttrValue::Type(dtype))
                .with_attr("shape", AttrValue::Shape(Shape::unknown())),
        )?;
        placeholder_of.insert(t.clone(), TensorRef::new(ph.clone(), 0));
        input_names.push(TensorRef::new(ph, 0));
        input_dtypes.push(dtype);
    }
    for m in members {
        let mut node = graph.node(m).cloned().ok_or_else(|| GraphError::UnknownNode(m.clone()))?;
        node.inputs = node
            .inputs
            .into_iter()
            .filter_map(|input| match input {
                Input::Data(t) => Some(Input::Data(placeholder_of.get(&t).cloned().unwrap_or(t))),
                Input::Control(_) => None,
            })
            .collect();
        sub.add_node(node)?;
    }

    let output_dtypes = outputs
        .iter()
        .map(|t| {
            graph.output_dtype(t).unwrap_or_else(|| {
                warn!(tensor = %t, segment = name, "cannot derive dtype of segment output");
                DataType::Invalid
            })
        })
        .collect();
    let n_in = external.len();
    let n_out = outputs.len();
    let segment = FusedSegment {
        graph: sub,
        input_names,
        input_dtypes,
        input_shapes: vec![Shape::unknown(); n_in],
        output_names: outputs.clone(),
        output_dtypes,
        output_shapes: vec![Shape::unknown(); n_out],
        executable: None,
        plan: None,
        input_batch_axis: Vec::new(),
        output_batch_axis: Vec::new(),
    };

    let mut fused = Node::new(name, OpKind::FusedSegment);
    fused.inputs = external.into_iter().map(Input::Data).collect();
    fused.inputs.extend(controls.into_iter().map(Input::Control));
    fused.segment = Some(Box::new(segment));

    let renames: HashMap<TensorRef, TensorRef> =
        outputs.iter().enumerate().map(|(j, t)| (t.clone(), TensorRef::new(name, j))).collect();
    for t in outputs_set {
        if let Some(to) = renames.get(t) {
            report.output_renames.insert(t.clone(), to.clone());
        }
    }

    let at = members.iter().filter_map(|m| graph.position(m)).min().unwrap_or(graph.len());
    graph.retain(|n| !member_set.contains(n.name.as_str()));
    for node in graph.nodes_mut() {
        for input in &mut node.inputs {
            if let Input::Data(t) = input {
                if let Some(to) = renames.get(t) {
                    *t = to.clone();
                }
            }
        }
    }
    graph.insert_node(at, fused)?;
    debug!(segment = name, inputs = n_in, outputs = n_out, members = members.len(), "fused cluster");
    Ok(())
}

/// Fuses every maximal data-connected cluster of whitelisted nodes into a
/// single `FusedSegment` node.
pub fn whitelist_partition(graph: &mut Graph, config: &PartitionConfig) -> Result<PartitionReport, GraphError> {
    let mut report = PartitionReport { original_controls: graph.control_inputs_index(), ..Default::default() };
    let mut index = ConsumerIndex::build(graph);

    let inputs = boundary_inputs(graph, config)?;
    let outputs = boundary_outputs(graph, &index, config)?;
    let producers: HashSet<&str> = inputs.iter().map(|t| t.node.as_str()).collect();
    let eligible: Vec<bool> = graph
        .nodes()
        .iter()
        .map(|n| is_eligible(graph, n, &index, config, &producers))
        .collect();
    let minimum = config.minimum_segment_size.unwrap_or_else(|| default_minimum_segment_size(graph));

    let groups: Vec<Vec<String>> = clusters(graph, &eligible)
        .into_iter()
        .map(|g| g.into_iter().map(|i| graph.nodes()[i].name.clone()).collect())
        .collect();

    let mut next = 0;
    for members in groups {
        if members.len() < minimum {
            debug!(?members, minimum, "cluster below minimum segment size");
            report.too_small.push(members);
            continue;
        }
        index.refresh(graph);
        let member_set: HashSet<String> = members.iter().cloned().collect();
        if contraction_creates_cycle(graph, &index, &member_set) {
            warn!(?members, "not fusing cluster: contraction would introduce a cycle");
            report.rejected.push(members);
            continue;
        }
        let name = unique_segment_name(graph, &mut next);
        contract(graph, &index, &members, &name, &outputs, &mut report)?;
        report.segments.push(name);
    }

    info!(
        segments = report.segments.len(),
        too_small = report.too_small.len(),
        rejected = report.rejected.len(),
        "partitioned graph"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ops: &[&str]) -> PartitionConfig {
        PartitionConfig {
            op_whitelist: ops.iter().map(|s| s.to_string()).collect(),
            minimum_segment_size: Some(2),
            ..Default::default()
        }
    }

    fn f32_node(name: &str, op: OpKind, inputs: &[&str]) -> Node {
        Node::new(name, op)
            .with_inputs(inputs)
            .unwrap()
            .with_attr("T", AttrValue::Type(DataType::F32))
    }

    fn abc() -> Graph {
        Graph::from_nodes(vec![
            Node::new("a", OpKind::Placeholder).with_attr("dtype", AttrValue::Type(DataType::F32)),
            f32_node("b", OpKind::Add, &["a", "a"]),
            f32_node("c", OpKind::Relu, &["b"]),
        ])
        .unwrap()
    }

    #[test]
    fn empty_whitelist_leaves_graph_untouched() {
        let mut g = abc();
        let before = g.clone();
        let report = whitelist_partition(&mut g, &config(&[])).unwrap();
        assert!(report.segments.is_empty());
        assert_eq!(g, before);
    }

    #[test]
    fn chain_becomes_one_segment() {
        let mut g = abc();
        let report = whitelist_partition(&mut g, &config(&["Add", "Relu"])).unwrap();
        assert_eq!(report.segments, vec!["segment_0".to_string()]);
        assert_eq!(g.len(), 2);
        let fused = g.node("segment_0").unwrap();
        assert_eq!(fused.data_inputs().cloned().collect::<Vec<_>>(), vec![TensorRef::new("a", 0)]);
        let seg = fused.segment.as_ref().unwrap();
        assert_eq!(seg.output_names, vec![TensorRef::new("c", 0)]);
        assert_eq!(seg.input_dtypes, vec![DataType::F32]);
        assert!(seg.is_consistent(1));
        assert_eq!(report.output_renames.get(&TensorRef::new("c", 0)), Some(&TensorRef::new("segment_0", 0)));
        let b = seg.graph.node("b").unwrap();
        assert!(b.data_inputs().all(|t| t.node == "segment_0/placeholder_0"));
    }

    #[test]
    fn small_and_excluded_nodes_stay_unfused() {
        let mut g = abc();
        let mut cfg = config(&["Add", "Relu"]);
        cfg.no_fuse_ops.insert("c".into());
        let report = whitelist_partition(&mut g, &cfg).unwrap();
        assert!(report.segments.is_empty());
        assert_eq!(report.too_small, vec![vec!["b".to_string()]]);

        let mut g = abc();
        let mut cfg = config(&["Add"]);
        cfg.force_fuse_ops.insert("c".into());
        let report = whitelist_partition(&mut g, &cfg).unwrap();
        assert_eq!(report.segments.len(), 1);
    }

    #[test]
    fn control_sources_are_excluded_and_controls_reattached() {
        let mut g = Graph::from_nodes(vec![
            Node::new("a", OpKind::Placeholder).with_attr("dtype", AttrValue::Type(DataType::F32)),
            f32_node("init", OpKind::Relu, &["a"]),
            f32_node("b", OpKind::Add, &["a", "a", "^init"]),
            f32_node("c", OpKind::Relu, &["b"]),
        ])
        .unwrap();
        let report = whitelist_partition(&mut g, &config(&["Add", "Relu"])).unwrap();
        assert_eq!(report.segments.len(), 1);
        assert!(g.contains("init"));
        let fused = g.node("segment_0").unwrap();
        assert_eq!(fused.control_inputs().collect::<Vec<_>>(), vec!["init"]);
        let inner = fused.segment.as_ref().unwrap().graph.node("b").unwrap();
        assert_eq!(inner.control_inputs().count(), 0);
        assert_eq!(report.original_controls.get("b"), Some(&vec!["init".to_string()]));
    }

    #[test]
    fn cluster_closing_a_cycle_is_rejected() {
        // b -> x -> d with b, d whitelisted and x not: fusing {b, d} would
        // make x both consumer and producer of the fused node.
        let mut g = Graph::from_nodes(vec![
            Node::new("a", OpKind::Placeholder).with_attr("dtype", AttrValue::Type(DataType::F32)),
            f32_node("b", OpKind::Relu, &["a"]),
            f32_node("x", OpKind::Other("Erf".into()), &["b"]),
            f32_node("d", OpKind::Add, &["b", "x"]),
        ])
        .unwrap();
        let before = g.clone();
        let report = whitelist_partition(&mut g, &config(&["Relu", "Add"])).unwrap();
        assert!(report.segments.is_empty());
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(g, before);
        assert!(g.is_acyclic());
    }

    #[test]
    fn string_tensors_are_never_fused() {
        let mut g = Graph::from_nodes(vec![
            Node::new("a", OpKind::Placeholder).with_attr("dtype", AttrValue::Type(DataType::Str)),
            Node::new("b", OpKind::Identity).with_inputs(&["a"]).unwrap().with_attr("T", AttrValue::Type(DataType::Str)),
            Node::new("c", OpKind::Identity).with_inputs(&["b"]).unwrap().with_attr("T", AttrValue::Type(DataType::Str)),
        ])
        .unwrap();
        let report = whitelist_partition(&mut g, &config(&["Identity"])).unwrap();
        assert!(report.segments.is_empty());
    }

    #[test]
    fn numbering_follows_node_order() {
        let mut g = Graph::from_nodes(vec![
            Node::new("a", OpKind::Placeholder).with_attr("dtype", AttrValue::Type(DataType::F32)),
            f32_node("p1", OpKind::Relu, &["a"]),
            f32_node("p2", OpKind::Relu, &["p1"]),
            f32_node("cut", OpKind::Other("Erf".into()), &["p2"]),
            f32_node("q1", OpKind::Relu, &["cut"]),
            f32_node("q2", OpKind::Relu, &["q1"]),
        ])
        .unwrap();
        let mut h = g.clone();
        whitelist_partition(&mut g, &config(&["Relu"])).unwrap();
        whitelist_partition(&mut h, &config(&["Relu"])).unwrap();
        assert_eq!(g, h);
        let first = g.node("segment_0").unwrap().segment.as_ref().unwrap();
        assert!(first.graph.contains("p1"));
        assert_eq!(g.node("cut").unwrap().data_inputs().next(), Some(&TensorRef::new("segment_0", 0)));
        assert!(g.is_acyclic());
    }
}
