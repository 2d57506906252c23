use crate::core::op::OpKind;
use crate::core::types::{DataType, Input, Shape, TensorRef};
use crate::error::{GraphError, WireError};
use crate::segment::FusedSegment;
use crate::tensor_util;
use crate::wire;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Typed node attribute. Values this crate has no use for are carried
/// unchanged in `Raw`.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bytes(Vec<u8>),
    Int(i64),
    Float(f32),
    Bool(bool),
    Type(DataType),
    Shape(Shape),
    Tensor(wire::TensorProto),
    List(AttrList),
    Placeholder(String),
    Func(wire::NameAttrList),
    Raw(wire::AttrValue),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttrList {
    pub bytes: Vec<Vec<u8>>,
    pub ints: Vec<i64>,
    pub floats: Vec<f32>,
    pub bools: Vec<bool>,
    pub types: Vec<DataType>,
    pub shapes: Vec<Shape>,
    pub tensors: Vec<wire::TensorProto>,
    pub funcs: Vec<wire::NameAttrList>,
}

impl AttrValue {
    pub fn from_wire(value: &wire::AttrValue) -> Self {
        use wire::attr_value::Value;
        match &value.value {
            Some(Value::S(s)) => AttrValue::Bytes(s.clone()),
            Some(Value::I(i)) => AttrValue::Int(*i),
            Some(Value::F(f)) => AttrValue::Float(*f),
            Some(Value::B(b)) => AttrValue::Bool(*b),
            Some(Value::Type(t)) => match DataType::from_enum(*t) {
                Some(dtype) => AttrValue::Type(dtype),
                None => AttrValue::Raw(value.clone()),
            },
            Some(Value::Shape(s)) => AttrValue::Shape(tensor_util::shape_from_proto(s)),
            Some(Value::Tensor(t)) => AttrValue::Tensor(t.clone()),
            Some(Value::Placeholder(p)) => AttrValue::Placeholder(p.clone()),
            Some(Value::Func(f)) => AttrValue::Func(f.clone()),
            Some(Value::List(list)) => {
                let types: Option<Vec<DataType>> = list.r#type.iter().map(|t| DataType::from_enum(*t)).collect();
                match types {
                    Some(types) => AttrValue::List(AttrList {
                        bytes: list.s.clone(),
                        ints: list.i.clone(),
                        floats: list.f.clone(),
                        bools: list.b.clone(),
                        types,
                        shapes: list.shape.iter().map(tensor_util::shape_from_proto).collect(),
                        tensors: list.tensor.clone(),
                        funcs: list.func.clone(),
                    }),
                    None => AttrValue::Raw(value.clone()),
                }
            }
            None => AttrValue::Raw(value.clone()),
        }
    }

    pub fn to_wire(&self) -> wire::AttrValue {
        use wire::attr_value::{ListValue, Value};
        let value = match self {
            AttrValue::Raw(raw) => return raw.clone(),
            AttrValue::Bytes(s) => Value::S(s.clone()),
            AttrValue::Int(i) => Value::I(*i),
            AttrValue::Float(f) => Value::F(*f),
            AttrValue::Bool(b) => Value::B(*b),
            AttrValue::Type(t) => Value::Type(t.to_enum()),
            AttrValue::Shape(s) => Value::Shape(tensor_util::shape_to_proto(s)),
            AttrValue::Tensor(t) => Value::Tensor(t.clone()),
            AttrValue::Placeholder(p) => Value::Placeholder(p.clone()),
            AttrValue::Func(f) => Value::Func(f.clone()),
            AttrValue::List(list) => Value::List(ListValue {
                s: list.bytes.clone(),
                i: list.ints.clone(),
                f: list.floats.clone(),
                b: list.bools.clone(),
                r#type: list.types.iter().map(|t| t.to_enum()).collect(),
                shape: list.shapes.iter().map(tensor_util::shape_to_proto).collect(),
                tensor: list.tensors.clone(),
                func: list.funcs.clone(),
            }),
        };
        wire::AttrValue { value: Some(value) }
    }

    pub fn int_list(values: Vec<i64>) -> Self {
        AttrValue::List(AttrList { ints: values, ..Default::default() })
    }

    pub fn shape_list(values: Vec<Shape>) -> Self {
        AttrValue::List(AttrList { shapes: values, ..Default::default() })
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_type(&self) -> Option<DataType> {
        match self {
            AttrValue::Type(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_shape(&self) -> Option<&Shape> {
        match self {
            AttrValue::Shape(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&wire::TensorProto> {
        match self {
            AttrValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&AttrList> {
        match self {
            AttrValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            AttrValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub op: OpKind,
    pub inputs: Vec<Input>,
    pub device: String,
    pub attrs: BTreeMap<String, AttrValue>,
    /// Present exactly when `op` is `FusedSegment`.
    pub segment: Option<Box<FusedSegment>>,
    pub debug_info: Option<Vec<u8>>,
    /// Encoded full-type annotation, carried through untouched.
    pub full_type: Option<Vec<u8>>,
}

impl Node {
    pub fn new(name: impl Into<String>, op: OpKind) -> Self {
        Self {
            name: name.into(),
            op,
            inputs: Vec::new(),
            device: String::new(),
            attrs: BTreeMap::new(),
            segment: None,
            debug_info: None,
            full_type: None,
        }
    }

    pub fn with_inputs(mut self, names: &[&str]) -> Result<Self, GraphError> {
        for name in names {
            self.inputs.push(Input::parse(name)?);
        }
        Ok(self)
    }

    pub fn with_attr(mut self, key: &str, value: AttrValue) -> Self {
        self.attrs.insert(key.to_string(), value);
        self
    }

    pub fn data_inputs(&self) -> impl Iterator<Item = &TensorRef> {
        self.inputs.iter().filter_map(Input::as_data)
    }

    pub fn control_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().filter_map(|i| match i {
            Input::Control(n) => Some(n.as_str()),
            Input::Data(_) => None,
        })
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    pub fn attr_int(&self, key: &str) -> Option<i64> {
        self.attr(key).and_then(AttrValue::as_int)
    }

    pub fn attr_bool(&self, key: &str) -> Option<bool> {
        self.attr(key).and_then(AttrValue::as_bool)
    }

    pub fn attr_type(&self, key: &str) -> Option<DataType> {
        self.attr(key).and_then(AttrValue::as_type)
    }

    pub fn attr_ints(&self, key: &str) -> Option<&[i64]> {
        self.attr(key).and_then(AttrValue::as_list).map(|l| l.ints.as_slice())
    }

    pub fn is_segment(&self) -> bool {
        self.segment.is_some()
    }

    /// Shapes recorded by the producer in `_output_shapes`, if any.
    pub fn recorded_output_shape(&self, port: usize) -> Option<&Shape> {
        self.attr("_output_shapes")?.as_list()?.shapes.get(port)
    }

    /// Element type of output `port`, derived from op kind and attributes.
    pub fn output_dtype(&self, port: usize) -> Option<DataType> {
        if let Some(segment) = &self.segment {
            return segment.output_dtypes.get(port).copied();
        }
        match &self.op {
            OpKind::Shape | OpKind::Size => Some(self.attr_type("out_type").unwrap_or(DataType::I32)),
            OpKind::Rank | OpKind::TensorArraySizeV3 => Some(DataType::I32),
            OpKind::Cast => self.attr_type("DstT"),
            OpKind::Range => self.attr_type("Tidx"),
            OpKind::Const | OpKind::Placeholder | OpKind::TensorArrayGatherV3 => self.attr_type("dtype"),
            OpKind::TensorArrayV3 => Some(if port == 0 { DataType::Resource } else { DataType::F32 }),
            OpKind::FusedBatchNorm | OpKind::FusedBatchNormV3 if port > 0 => {
                self.attr_type("U").or_else(|| self.attr_type("T"))
            }
            _ => {
                if let Some(list) = self.attr("T").and_then(AttrValue::as_list) {
                    return list.types.get(port).copied();
                }
                self.attr_type("T")
                    .or_else(|| self.attr_type("dtype"))
                    .or_else(|| self.attr_type("out_type"))
            }
        }
    }

    pub fn from_node_def(def: &wire::NodeDef) -> Result<Self, WireError> {
        let mut attrs: BTreeMap<String, AttrValue> =
            def.attr.iter().map(|(k, v)| (k.clone(), AttrValue::from_wire(v))).collect();
        let op = OpKind::parse(&def.op);
        let segment = if op == OpKind::FusedSegment {
            Some(Box::new(FusedSegment::take_from_attrs(&def.name, &mut attrs)?))
        } else {
            None
        };
        let inputs = def.input.iter().map(|s| Input::parse(s)).collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: def.name.clone(),
            op,
            inputs,
            device: def.device.clone(),
            attrs,
            segment,
            debug_info: def.experimental_debug_info.clone(),
            full_type: def.experimental_type.clone(),
        })
    }

    pub fn to_node_def(&self) -> wire::NodeDef {
        let mut attr: BTreeMap<String, wire::AttrValue> =
            self.attrs.iter().map(|(k, v)| (k.clone(), v.to_wire())).collect();
        if let Some(segment) = &self.segment {
            segment.write_attrs(&mut attr);
        }
        wire::NodeDef {
            name: self.name.clone(),
            op: self.op.as_str().to_string(),
            input: self.inputs.iter().map(|i| i.to_string()).collect(),
            device: self.device.clone(),
            attr,
            experimental_debug_info: self.debug_info.clone(),
            experimental_type: self.full_type.clone(),
        }
    }
}

/// Node storage with name lookup. Insertion order is preserved and drives
/// every deterministic traversal in the crate.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    version: u64,
    pub versions: Option<wire::VersionDef>,
    pub library: Option<Vec<u8>>,
    pub legacy_version: i32,
}

/// Node-set equality: order and bookkeeping are ignored.
impl PartialEq for Graph {
    fn eq(&self, other: &Self) -> bool {
        self.nodes.len() == other.nodes.len()
            && self.nodes.iter().all(|n| other.node(&n.name) == Some(n))
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_nodes(nodes: Vec<Node>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for node in nodes {
            graph.add_node(node)?;
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Bumped by every mutation; consumer indices compare against it.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Mutable access to every node. Names must not be changed through this
    /// path; use `rename_node`.
    pub fn nodes_mut(&mut self) -> &mut [Node] {
        self.version += 1;
        &mut self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        let i = *self.index.get(name)?;
        self.version += 1;
        Some(&mut self.nodes[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn add_node(&mut self, node: Node) -> Result<(), GraphError> {
        let at = self.nodes.len();
        self.insert_node(at, node)
    }

    pub fn insert_node(&mut self, at: usize, node: Node) -> Result<(), GraphError> {
        if self.index.contains_key(&node.name) {
            return Err(GraphError::DuplicateNode(node.name));
        }
        let at = at.min(self.nodes.len());
        self.nodes.insert(at, node);
        if at + 1 == self.nodes.len() {
            self.index.insert(self.nodes[at].name.clone(), at);
        } else {
            self.reindex();
        }
        self.version += 1;
        Ok(())
    }

    pub fn remove_node(&mut self, name: &str) -> Option<Node> {
        let at = self.index.remove(name)?;
        let node = self.nodes.remove(at);
        self.reindex();
        self.version += 1;
        Some(node)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&Node) -> bool) {
        self.nodes.retain(|n| keep(n));
        self.reindex();
        self.version += 1;
    }

    fn reindex(&mut self) {
        self.index = self.nodes.iter().enumerate().map(|(i, n)| (n.name.clone(), i)).collect();
    }

    /// Renames `old` to `new` and rewrites every data and control reference
    /// in the graph. Nothing changes unless the whole rename can succeed.
    pub fn rename_node(&mut self, old: &str, new: &str) -> Result<(), GraphError> {
        if old == new {
            return Ok(());
        }
        let at = self.position(old).ok_or_else(|| GraphError::UnknownNode(old.to_string()))?;
        if self.index.contains_key(new) {
            return Err(GraphError::DuplicateNode(new.to_string()));
        }
        self.nodes[at].name = new.to_string();
        for node in &mut self.nodes {
            for input in &mut node.inputs {
                match input {
                    Input::Data(t) if t.node == old => t.node = new.to_string(),
                    Input::Control(n) if n == old => *n = new.to_string(),
                    _ => {}
                }
            }
        }
        self.index.remove(old);
        self.index.insert(new.to_string(), at);
        self.version += 1;
        Ok(())
    }

    /// Every input must name an existing node.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in &self.nodes {
            for input in &node.inputs {
                if !self.contains(input.node_name()) {
                    return Err(GraphError::DanglingReference {
                        node: node.name.clone(),
                        missing: input.node_name().to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Data-edge graph over node positions. Loop back edges (out of
    /// `NextIteration`) are left out so loop bodies stay acyclic.
    pub fn data_graph(&self) -> DiGraph<usize, ()> {
        let mut g = DiGraph::with_capacity(self.nodes.len(), self.nodes.len());
        let ids: Vec<NodeIndex> = (0..self.nodes.len()).map(|i| g.add_node(i)).collect();
        for (dst, node) in self.nodes.iter().enumerate() {
            for t in node.data_inputs() {
                if let Some(src) = self.position(&t.node) {
                    if self.nodes[src].op != OpKind::NextIteration {
                        g.add_edge(ids[src], ids[dst], ());
                    }
                }
            }
        }
        g
    }

    pub fn is_acyclic(&self) -> bool {
        !is_cyclic_directed(&self.data_graph())
    }

    /// Node positions in dependency order.
    pub fn topo_order(&self) -> Result<Vec<usize>, GraphError> {
        let g = self.data_graph();
        let order = toposort(&g, None).map_err(|_| GraphError::Cycle)?;
        Ok(order.into_iter().map(|ix| g[ix]).collect())
    }

    pub fn output_dtype(&self, tensor: &TensorRef) -> Option<DataType> {
        self.node(&tensor.node)?.output_dtype(tensor.port)
    }

    /// `node -> control input sources`, captured before partitioning.
    pub fn control_inputs_index(&self) -> BTreeMap<String, Vec<String>> {
        self.nodes
            .iter()
            .filter(|n| n.control_inputs().next().is_some())
            .map(|n| (n.name.clone(), n.control_inputs().map(str::to_string).collect()))
            .collect()
    }

    pub fn segment_names(&self) -> Vec<String> {
        self.nodes.iter().filter(|n| n.is_segment()).map(|n| n.name.clone()).collect()
    }

    pub fn from_graph_def(def: &wire::GraphDef) -> Result<Self, WireError> {
        let mut graph = Self::new();
        for node in &def.node {
            graph.add_node(Node::from_node_def(node)?)?;
        }
        graph.versions = def.versions.clone();
        graph.library = def.library.clone();
        graph.legacy_version = def.version;
        Ok(graph)
    }

    pub fn to_graph_def(&self) -> wire::GraphDef {
        wire::GraphDef {
            node: self.nodes.iter().map(Node::to_node_def).collect(),
            library: self.library.clone(),
            version: self.legacy_version,
            versions: self.versions.clone(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Self::from_graph_def(&wire::decode_graph(bytes)?)
    }

    pub fn encode(&self) -> Vec<u8> {
        wire::encode_graph(&self.to_graph_def())
    }
}

/// Tensor → consumers map, stamped with the graph version it was built
/// from. Any mutation of the graph makes it stale.
#[derive(Debug, Clone, Default)]
pub struct ConsumerIndex {
    version: u64,
    data: HashMap<TensorRef, Vec<String>>,
    control: HashMap<String, Vec<String>>,
    ports: HashMap<String, BTreeSet<usize>>,
}

impl ConsumerIndex {
    pub fn build(graph: &Graph) -> Self {
        let mut index = Self { version: graph.version(), ..Default::default() };
        for node in graph.nodes() {
            for input in &node.inputs {
                match input {
                    Input::Data(t) => {
                        index.data.entry(t.clone()).or_default().push(node.name.clone());
                        index.ports.entry(t.node.clone()).or_default().insert(t.port);
                    }
                    Input::Control(src) => {
                        index.control.entry(src.clone()).or_default().push(node.name.clone());
                    }
                }
            }
        }
        index
    }

    pub fn is_current(&self, graph: &Graph) -> bool {
        self.version == graph.version()
    }

    pub fn refresh(&mut self, graph: &Graph) {
        if !self.is_current(graph) {
            *self = Self::build(graph);
        }
    }

    pub fn consumers(&self, tensor: &TensorRef) -> &[String] {
        self.data.get(tensor).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn control_consumers(&self, node: &str) -> &[String] {
        self.control.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_control_consumers(&self, node: &str) -> bool {
        !self.control_consumers(node).is_empty()
    }

    /// Ports of `node` that at least one node reads, ascending.
    pub fn consumed_ports(&self, node: &str) -> Vec<usize> {
        self.ports.get(node).map(|p| p.iter().copied().collect()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Graph {
        Graph::from_nodes(vec![
            Node::new("a", OpKind::Placeholder).with_attr("dtype", AttrValue::Type(DataType::F32)),
            Node::new("b", OpKind::Add).with_inputs(&["a", "a"]).unwrap(),
            Node::new("c", OpKind::Relu).with_inputs(&["b", "^a"]).unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn rename_rewrites_data_and_control_references() {
        let mut g = chain();
        g.rename_node("a", "input").unwrap();
        assert!(g.node("a").is_none());
        let b = g.node("b").unwrap();
        assert!(b.data_inputs().all(|t| t.node == "input"));
        let c = g.node("c").unwrap();
        assert_eq!(c.control_inputs().collect::<Vec<_>>(), vec!["input"]);
        g.validate().unwrap();
    }

    #[test]
    fn rename_onto_existing_name_changes_nothing() {
        let mut g = chain();
        let before = g.clone();
        assert_eq!(g.rename_node("a", "b"), Err(GraphError::DuplicateNode("b".into())));
        assert_eq!(g, before);
        assert_eq!(g.rename_node("zz", "y"), Err(GraphError::UnknownNode("zz".into())));
    }

    #[test]
    fn consumer_index_goes_stale_on_mutation() {
        let mut g = chain();
        let index = ConsumerIndex::build(&g);
        assert_eq!(index.consumers(&TensorRef::new("a", 0)), &["b".to_string(), "b".to_string()]);
        assert!(index.has_control_consumers("a"));
        assert_eq!(index.consumed_ports("b"), vec![0]);
        assert!(index.is_current(&g));
        g.rename_node("c", "out").unwrap();
        assert!(!index.is_current(&g));
    }

    #[test]
    fn topo_order_ignores_loop_back_edges() {
        let g = Graph::from_nodes(vec![
            Node::new("enter", OpKind::Enter),
            Node::new("merge", OpKind::Other("Merge".into())).with_inputs(&["enter", "next"]).unwrap(),
            Node::new("body", OpKind::Relu).with_inputs(&["merge"]).unwrap(),
            Node::new("next", OpKind::NextIteration).with_inputs(&["body"]).unwrap(),
        ])
        .unwrap();
        assert!(g.is_acyclic());
        let order = g.topo_order().unwrap();
        let pos = |name: &str| order.iter().position(|&i| g.nodes()[i].name == name).unwrap();
        assert!(pos("enter") < pos("merge"));
        assert!(pos("body") < pos("next"));
    }

    #[test]
    fn dangling_reference_is_reported() {
        let mut g = chain();
        g.remove_node("a");
        assert!(matches!(g.validate(), Err(GraphError::DanglingReference { .. })));
    }

    #[test]
    fn graph_def_roundtrip_keeps_nodes() {
        let g = chain();
        let back = Graph::decode(&g.encode()).unwrap();
        assert_eq!(back, g);
        assert_eq!(back.nodes()[2].name, "c");
    }

    #[test]
    fn full_type_annotation_is_carried() {
        let mut g = chain();
        g.node_mut("b").unwrap().full_type = Some(vec![0x08, 0x02]);
        let def = g.to_graph_def();
        assert_eq!(def.node[1].experimental_type, Some(vec![0x08, 0x02]));
        let back = Graph::decode(&g.encode()).unwrap();
        assert_eq!(back.node("b").unwrap().full_type, Some(vec![0x08, 0x02]));
    }
}
