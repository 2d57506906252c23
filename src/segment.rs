use crate::core::types::{DataType, Shape, TensorRef};
use crate::error::WireError;
use crate::execution_plan::ExecutionPlan;
use crate::graph::{AttrList, AttrValue, Graph};
use crate::wire;
use std::collections::BTreeMap;

pub const ATTR_GRAPH_DEF: &str = "graph_def";
pub const ATTR_INPUT_NAMES: &str = "input_names";
pub const ATTR_INPUT_DTYPES: &str = "input_dtypes";
pub const ATTR_INPUT_SHAPES: &str = "input_shapes";
pub const ATTR_OUTPUT_NAMES: &str = "output_names";
pub const ATTR_OUTPUT_DTYPES: &str = "output_dtypes";
pub const ATTR_OUTPUT_SHAPES: &str = "output_shapes";
pub const ATTR_EXECUTABLE: &str = "executable";
pub const ATTR_MODEL_CONFIG: &str = "model_config";
pub const ATTR_INPUT_BATCH_AXIS: &str = "input_batch_axis";
pub const ATTR_OUTPUT_BATCH_AXIS: &str = "output_batch_axis";

/// Payload of a fused node. The node's own data inputs are the external
/// tensors; `input_names[i]` is the placeholder standing in for input `i`
/// inside `graph`, and `output_names[j]` the internal tensor behind port `j`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FusedSegment {
    pub graph: Graph,
    pub input_names: Vec<TensorRef>,
    pub input_dtypes: Vec<DataType>,
    pub input_shapes: Vec<Shape>,
    pub output_names: Vec<TensorRef>,
    pub output_dtypes: Vec<DataType>,
    pub output_shapes: Vec<Shape>,
    pub executable: Option<Vec<u8>>,
    pub plan: Option<ExecutionPlan>,
    /// Batch axis per input: `0` when the runtime may vary dimension 0,
    /// `-1` otherwise. Empty until batch axes are marked.
    pub input_batch_axis: Vec<i64>,
    pub output_batch_axis: Vec<i64>,
}

impl FusedSegment {
    pub fn is_compiled(&self) -> bool {
        self.executable.as_ref().is_some_and(|e| !e.is_empty())
    }

    pub fn is_consistent(&self, external_inputs: usize) -> bool {
        let n = self.input_names.len();
        let m = self.output_names.len();
        n == external_inputs
            && self.input_dtypes.len() == n
            && self.input_shapes.len() == n
            && self.output_dtypes.len() == m
            && self.output_shapes.len() == m
    }

    /// Conditions that keep the segment away from the compiler.
    pub fn unmet_conditions(&self) -> Vec<&'static str> {
        let mut reasons = Vec::new();
        if self.input_names.is_empty() {
            reasons.push("it does not have inputs");
        }
        if self.output_names.is_empty() {
            reasons.push("it does not have outputs");
        }
        if !self.input_shapes.iter().all(Shape::is_fully_defined) {
            reasons.push("input shapes are not fully defined");
        }
        if self.output_shapes.len() != self.output_names.len()
            || !self.output_shapes.iter().all(Shape::is_fully_defined)
        {
            reasons.push("output shapes are not fully defined");
        }
        reasons
    }

    pub fn skip_reason(&self) -> Option<String> {
        let reasons = self.unmet_conditions();
        if reasons.is_empty() { None } else { Some(reasons.join(" and ")) }
    }

    /// Total byte size of all inputs, assuming fully defined shapes.
    pub fn input_bytes(&self) -> usize {
        self.input_shapes
            .iter()
            .zip(&self.input_dtypes)
            .map(|(s, d)| s.num_elements().unwrap_or(0).saturating_mul(d.size().unwrap_or(0)))
            .fold(0, usize::saturating_add)
    }

    pub fn take_from_attrs(node: &str, attrs: &mut BTreeMap<String, AttrValue>) -> Result<Self, WireError> {
        let bad = |key: &str| WireError::BadAttr { node: node.to_string(), key: key.to_string() };

        let graph = match attrs.remove(ATTR_GRAPH_DEF) {
            Some(AttrValue::Bytes(bytes)) => Graph::decode(&bytes)?,
            _ => return Err(bad(ATTR_GRAPH_DEF)),
        };
        let mut list = |key: &str| -> Result<AttrList, WireError> {
            match attrs.remove(key) {
                None => Ok(AttrList::default()),
                Some(AttrValue::List(l)) => Ok(l),
                Some(_) => Err(bad(key)),
            }
        };
        let input_names = list(ATTR_INPUT_NAMES)?;
        let input_dtypes = list(ATTR_INPUT_DTYPES)?.types;
        let input_shapes = list(ATTR_INPUT_SHAPES)?.shapes;
        let output_names = list(ATTR_OUTPUT_NAMES)?;
        let output_dtypes = list(ATTR_OUTPUT_DTYPES)?.types;
        let output_shapes = list(ATTR_OUTPUT_SHAPES)?.shapes;
        let model_config = list(ATTR_MODEL_CONFIG)?.ints;
        let input_batch_axis = list(ATTR_INPUT_BATCH_AXIS)?.ints;
        let output_batch_axis = list(ATTR_OUTPUT_BATCH_AXIS)?.ints;

        let parse_names = |l: AttrList, key: &str| -> Result<Vec<TensorRef>, WireError> {
            l.bytes
                .iter()
                .map(|b| {
                    let s = std::str::from_utf8(b).map_err(|_| bad(key))?;
                    TensorRef::parse(s).map_err(|_| bad(key))
                })
                .collect()
        };
        let input_names = parse_names(input_names, ATTR_INPUT_NAMES)?;
        let output_names = parse_names(output_names, ATTR_OUTPUT_NAMES)?;

        let executable = match attrs.remove(ATTR_EXECUTABLE) {
            None => None,
            Some(AttrValue::Bytes(b)) if b.is_empty() => None,
            Some(AttrValue::Bytes(b)) => Some(b),
            Some(_) => return Err(bad(ATTR_EXECUTABLE)),
        };

        Ok(Self {
            graph,
            input_names,
            input_dtypes,
            input_shapes,
            output_names,
            output_dtypes,
            output_shapes,
            executable,
            plan: ExecutionPlan::from_model_config(&model_config),
            input_batch_axis,
            output_batch_axis,
        })
    }

    pub fn write_attrs(&self, attr: &mut BTreeMap<String, wire::AttrValue>) {
        let names = |refs: &[TensorRef]| {
            AttrValue::List(AttrList {
                bytes: refs.iter().map(|t| t.full_name().into_bytes()).collect(),
                ..Default::default()
            })
        };
        let types = |t: &[DataType]| AttrValue::List(AttrList { types: t.to_vec(), ..Default::default() });

        let mut put = |key: &str, value: AttrValue| {
            attr.insert(key.to_string(), value.to_wire());
        };
        put(ATTR_GRAPH_DEF, AttrValue::Bytes(self.graph.encode()));
        put(ATTR_INPUT_NAMES, names(&self.input_names));
        put(ATTR_INPUT_DTYPES, types(&self.input_dtypes));
        put(ATTR_INPUT_SHAPES, AttrValue::shape_list(self.input_shapes.clone()));
        put(ATTR_OUTPUT_NAMES, names(&self.output_names));
        put(ATTR_OUTPUT_DTYPES, types(&self.output_dtypes));
        put(ATTR_OUTPUT_SHAPES, AttrValue::shape_list(self.output_shapes.clone()));
        put(ATTR_EXECUTABLE, AttrValue::Bytes(self.executable.clone().unwrap_or_default()));
        if let Some(plan) = &self.plan {
            put(ATTR_MODEL_CONFIG, AttrValue::int_list(plan.to_model_config()));
        }
        if !self.input_batch_axis.is_empty() || !self.output_batch_axis.is_empty() {
            put(ATTR_INPUT_BATCH_AXIS, AttrValue::int_list(self.input_batch_axis.clone()));
            put(ATTR_OUTPUT_BATCH_AXIS, AttrValue::int_list(self.output_batch_axis.clone()));
        }
    }
}

/// The pre-partition tensor behind `t`, looking through fused nodes.
pub fn source_tensor(graph: &Graph, t: &TensorRef) -> TensorRef {
    graph
        .node(&t.node)
        .and_then(|n| n.segment.as_deref())
        .and_then(|s| s.output_names.get(t.port))
        .cloned()
        .unwrap_or_else(|| t.clone())
}
