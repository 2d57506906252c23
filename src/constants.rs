//! Large constant payloads are lifted out of the graph for the duration of
//! partitioning and put back before anything is written out.

use crate::core::op::OpKind;
use crate::graph::{AttrValue, Graph};
use crate::tensor_util;
use crate::wire::TensorProto;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Payloads of erased `Const` nodes, keyed by node name.
#[derive(Debug, Clone, Default)]
pub struct ConstantStore {
    payloads: BTreeMap<String, TensorProto>,
}

/// Copy of `proto` with dtype and shape but no values.
fn stripped(proto: &TensorProto) -> TensorProto {
    TensorProto {
        dtype: proto.dtype,
        tensor_shape: proto.tensor_shape.clone(),
        version_number: proto.version_number,
        ..Default::default()
    }
}

impl ConstantStore {
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.payloads.contains_key(node)
    }

    /// Puts the held payloads back into `graph` and into the sub-graphs of
    /// its fused segments. A node is only refilled while its value is still
    /// the erased form; nodes rewritten in the meantime are left alone.
    /// Returns how many nodes were refilled.
    pub fn restore(&self, graph: &mut Graph) -> usize {
        if self.payloads.is_empty() {
            return 0;
        }
        let mut restored = 0;
        for node in graph.nodes_mut() {
            if let Some(segment) = node.segment.as_deref_mut() {
                restored += self.restore(&mut segment.graph);
                continue;
            }
            if node.op != OpKind::Const {
                continue;
            }
            let Some(full) = self.payloads.get(&node.name) else { continue };
            let Some(AttrValue::Tensor(current)) = node.attrs.get_mut("value") else { continue };
            if *current == stripped(full) {
                *current = full.clone();
                restored += 1;
            }
        }
        restored
    }
}

/// Moves the value of every `Const` larger than
/// [`tensor_util::LARGE_CONST_BYTES`] into the returned store, leaving dtype
/// and shape in place.
pub fn run_erase_large_constants(graph: &mut Graph) -> ConstantStore {
    let mut store = ConstantStore::default();
    for node in graph.nodes_mut() {
        if node.op != OpKind::Const {
            continue;
        }
        let Some(AttrValue::Tensor(proto)) = node.attrs.get_mut("value") else { continue };
        if tensor_util::is_small(proto) {
            continue;
        }
        let empty = stripped(proto);
        let full = std::mem::replace(proto, empty);
        debug!(node = %node.name, "erased constant payload");
        store.payloads.insert(node.name.clone(), full);
    }
    if !store.is_empty() {
        info!(count = store.len(), "large constants erased");
    }
    store
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{DataType, Shape};
    use crate::graph::Node;
    use crate::segment::FusedSegment;

    fn weights(name: &str, n: usize) -> Node {
        let proto = TensorProto {
            dtype: DataType::F32.to_enum(),
            tensor_shape: Some(tensor_util::shape_to_proto(&Shape::from_dims(&[n]))),
            tensor_content: vec![7u8; n * 4],
            ..Default::default()
        };
        Node::new(name, OpKind::Const)
            .with_attr("dtype", AttrValue::Type(DataType::F32))
            .with_attr("value", AttrValue::Tensor(proto))
    }

    fn graph() -> Graph {
        Graph::from_nodes(vec![
            weights("w", 1024),
            weights("bias", 4),
            Node::new("y", OpKind::Add).with_inputs(&["w", "bias"]).unwrap(),
        ])
        .unwrap()
    }

    fn payload(g: &Graph, name: &str) -> usize {
        g.node(name).unwrap().attr("value").and_then(AttrValue::as_tensor).unwrap().tensor_content.len()
    }

    #[test]
    fn only_large_constants_are_erased() {
        let original = graph();
        let mut g = original.clone();
        let store = run_erase_large_constants(&mut g);
        assert_eq!(store.len(), 1);
        assert!(store.contains("w"));
        assert_eq!(payload(&g, "w"), 0);
        assert_eq!(payload(&g, "bias"), 16);
        let shape = g.node("w").unwrap().attr("value").and_then(AttrValue::as_tensor).unwrap().tensor_shape.clone();
        assert_eq!(shape.map(|s| tensor_util::shape_from_proto(&s)), Some(Shape::from_dims(&[1024])));

        assert_eq!(store.restore(&mut g), 1);
        assert_eq!(g, original);
    }

    #[test]
    fn restore_reaches_into_segments() {
        let mut inner = graph();
        let store = run_erase_large_constants(&mut inner);
        let mut fused = Node::new("segment_0", OpKind::FusedSegment);
        fused.segment = Some(Box::new(FusedSegment { graph: inner, ..Default::default() }));
        let mut g = Graph::from_nodes(vec![fused]).unwrap();

        assert_eq!(store.restore(&mut g), 1);
        let seg = &g.node("segment_0").unwrap().segment.as_ref().unwrap().graph;
        assert_eq!(payload(seg, "w"), 4096);
    }

    #[test]
    fn rewritten_constant_is_not_overwritten() {
        let mut g = graph();
        let store = run_erase_large_constants(&mut g);
        let replacement = weights("w", 2);
        g.node_mut("w").unwrap().attrs = replacement.attrs.clone();
        assert_eq!(store.restore(&mut g), 0);
        assert_eq!(payload(&g, "w"), 8);
    }
}
