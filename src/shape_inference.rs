//! Shape propagation over a graph: seeds from hints and recorded shapes,
//! evaluates small shape-computing subgraphs symbolically, applies a
//! per-op shape function everywhere else, and falls back to executing the
//! graph for tensors that are still unresolved.

use crate::core::op::OpKind;
use crate::core::types::{DataType, Dim, Shape, TensorRef, TensorValue};
use crate::error::ShapeError;
use crate::graph::{AttrValue, Graph, Node};
use crate::shape_engine::{ShapeEngine, SliceMasks};
use crate::tensor_util;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Runs (part of) the original graph to observe actual tensor shapes.
pub trait ShapeOracle {
    fn is_fetchable(&self, tensor: &TensorRef) -> bool;
    fn run(&self, tensors: &[TensorRef], samples: &HashMap<String, TensorValue>) -> anyhow::Result<Vec<Shape>>;
}

/// Caller-supplied shapes and values, keyed by tensor name.
#[derive(Debug, Clone, Default)]
pub struct ShapeHints {
    pub shapes: HashMap<String, Shape>,
    pub values: HashMap<String, TensorValue>,
}

#[derive(Debug, Clone, Default)]
pub struct ShapeMap {
    shapes: HashMap<TensorRef, Shape>,
    values: HashMap<TensorRef, TensorValue>,
}

impl ShapeMap {
    pub fn shape(&self, tensor: &TensorRef) -> Shape {
        self.shapes.get(tensor).cloned().unwrap_or_default()
    }

    pub fn value(&self, tensor: &TensorRef) -> Option<&TensorValue> {
        self.values.get(tensor)
    }

    pub fn is_fully_defined(&self, tensor: &TensorRef) -> bool {
        self.shapes.get(tensor).is_some_and(Shape::is_fully_defined)
    }

    /// Merges `shape` into what is known; returns whether anything changed.
    pub fn merge_shape(&mut self, tensor: &TensorRef, shape: &Shape) -> Result<bool, ShapeError> {
        let current = self.shapes.get(tensor).cloned().unwrap_or_default();
        let merged = current.merge(shape)?;
        if merged == current && self.shapes.contains_key(tensor) {
            return Ok(false);
        }
        let changed = merged != current;
        self.shapes.insert(tensor.clone(), merged);
        Ok(changed)
    }

    pub fn set_value(&mut self, tensor: &TensorRef, value: TensorValue) -> Result<bool, ShapeError> {
        self.merge_shape(tensor, &value.shape())?;
        Ok(self.values.insert(tensor.clone(), value).is_none())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShapeReport {
    pub passes: usize,
    pub evaluated: usize,
    pub from_oracle: Vec<TensorRef>,
    /// Tensors left without a fully defined shape after every fallback.
    pub unresolved: Vec<TensorRef>,
    /// Nodes whose shape function failed, with the error. Their outputs keep
    /// whatever was known before.
    pub failed_nodes: Vec<(String, ShapeError)>,
}

pub struct ShapeInference<'g> {
    graph: &'g Graph,
    map: ShapeMap,
    tensor_array_sizes: HashMap<String, TensorValue>,
    evaluated: usize,
    failed: Vec<(String, ShapeError)>,
}

impl<'g> ShapeInference<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self { graph, map: ShapeMap::default(), tensor_array_sizes: HashMap::new(), evaluated: 0, failed: Vec::new() }
    }

    pub fn seed(&mut self, hints: &ShapeHints) -> Result<(), ShapeError> {
        for (name, shape) in &hints.shapes {
            match TensorRef::parse(name) {
                Ok(t) => {
                    self.map.merge_shape(&t, shape).map_err(|e| e.at_node(&t.node))?;
                }
                Err(_) => warn!(tensor = %name, "ignoring shape hint with malformed tensor name"),
            }
        }
        for (name, value) in &hints.values {
            match TensorRef::parse(name) {
                Ok(t) => {
                    self.map.set_value(&t, value.clone()).map_err(|e| e.at_node(&t.node))?;
                }
                Err(_) => warn!(tensor = %name, "ignoring value hint with malformed tensor name"),
            }
        }
        for node in self.graph.nodes() {
            let out = TensorRef::new(node.name.clone(), 0);
            match node.op {
                OpKind::Placeholder => {
                    if let Some(shape) = node.attr("shape").and_then(AttrValue::as_shape) {
                        self.map.merge_shape(&out, shape).map_err(|e| e.at_node(&node.name))?;
                    }
                }
                OpKind::Const => {
                    if let Some(proto) = node.attr("value").and_then(AttrValue::as_tensor) {
                        if let Some(shape) = &proto.tensor_shape {
                            self.map
                                .merge_shape(&out, &tensor_util::shape_from_proto(shape))
                                .map_err(|e| e.at_node(&node.name))?;
                        }
                        if tensor_util::is_small(proto) {
                            if let Some(value) = tensor_util::value_from_proto(proto) {
                                self.map.set_value(&out, value).map_err(|e| e.at_node(&node.name))?;
                            }
                        }
                    }
                }
                _ => {}
            }
            if let Some(list) = node.attr("_output_shapes").and_then(AttrValue::as_list) {
                for (port, shape) in list.shapes.iter().enumerate() {
                    if shape.is_fully_defined() {
                        self.map
                            .merge_shape(&TensorRef::new(node.name.clone(), port), shape)
                            .map_err(|e| e.at_node(&node.name))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Propagates to a fixpoint, bounded by the number of loop back edges.
    /// A node whose shape function fails is reported and skipped from then on.
    pub fn run(&mut self) -> usize {
        let graph = self.graph;
        let loops = graph.nodes().iter().filter(|n| n.op == OpKind::NextIteration).count();
        let max_passes = loops.max(1);
        let order = graph.topo_order().unwrap_or_else(|_| (0..graph.len()).collect());
        let mut skip: HashSet<usize> = HashSet::new();
        let mut passes = 0;
        let mut changed = true;
        while changed && passes < max_passes {
            changed = false;
            passes += 1;
            for &i in &order {
                if skip.contains(&i) {
                    continue;
                }
                let node = &graph.nodes()[i];
                match self.visit(node) {
                    Ok(c) => changed |= c,
                    Err(err) => {
                        warn!(node = %node.name, error = %err, "shape inference failed; leaving outputs unresolved");
                        skip.insert(i);
                        self.failed.push((node.name.clone(), err));
                    }
                }
            }
        }
        passes
    }

    pub fn finish(self) -> (ShapeMap, ShapeReport) {
        let report = ShapeReport { evaluated: self.evaluated, failed_nodes: self.failed, ..Default::default() };
        (self.map, report)
    }

    fn visit(&mut self, node: &Node) -> Result<bool, ShapeError> {
        let mut changed = false;
        let out = TensorRef::new(node.name.clone(), 0);
        if self.map.value(&out).is_none() {
            match self.evaluate(node) {
                Ok(Some(value)) => {
                    self.evaluated += 1;
                    changed |= self.map.set_value(&out, value)?;
                }
                Ok(None) => {}
                Err(err) => debug!(node = %node.name, error = %err, "not evaluated symbolically"),
            }
        }
        if node.op == OpKind::TensorArrayV3 {
            if let Some(size) = self.input_value(node, 0) {
                let size = size.clone();
                self.tensor_array_sizes.insert(node.name.clone(), size);
            }
        }
        let inputs: Vec<Shape> = node.data_inputs().map(|t| self.map.shape(t)).collect();
        for (port, shape) in self.shape_fn(node, &inputs)?.iter().enumerate() {
            changed |= self.map.merge_shape(&TensorRef::new(node.name.clone(), port), shape)?;
        }
        Ok(changed)
    }

    fn input<'a>(&self, node: &'a Node, i: usize) -> Option<&'a TensorRef> {
        node.data_inputs().nth(i)
    }

    fn input_value(&self, node: &Node, i: usize) -> Option<&TensorValue> {
        self.input(node, i).and_then(|t| self.map.value(t))
    }

    fn input_values(&self, node: &Node) -> Option<Vec<TensorValue>> {
        node.data_inputs().map(|t| self.map.value(t).cloned()).collect()
    }

    fn out_dtype(node: &Node, fallback: DataType) -> DataType {
        node.output_dtype(0).unwrap_or(fallback)
    }

    fn slice_masks(node: &Node) -> SliceMasks {
        let mask = |key: &str| node.attr_int(key).unwrap_or(0);
        SliceMasks {
            begin: mask("begin_mask"),
            end: mask("end_mask"),
            ellipsis: mask("ellipsis_mask"),
            new_axis: mask("new_axis_mask"),
            shrink_axis: mask("shrink_axis_mask"),
        }
    }

    /// Closed-form evaluation for shape-computing ops.
    fn evaluate(&self, node: &Node) -> Result<Option<TensorValue>, ShapeError> {
        let dtype = Self::out_dtype(node, DataType::I32);
        let value = match &node.op {
            OpKind::Shape => {
                let Some(dims) = self.input(node, 0).and_then(|t| self.map.shape(t).as_static()) else {
                    return Ok(None);
                };
                TensorValue::ints(dtype, vec![dims.len()], dims.iter().map(|d| *d as i64).collect())
            }
            OpKind::Size => {
                let Some(n) = self.input(node, 0).and_then(|t| self.map.shape(t).num_elements()) else {
                    return Ok(None);
                };
                TensorValue::ints(dtype, vec![], vec![n as i64])
            }
            OpKind::Rank => {
                let Some(r) = self.input(node, 0).and_then(|t| self.map.shape(t).rank()) else {
                    return Ok(None);
                };
                TensorValue::ints(DataType::I32, vec![], vec![r as i64])
            }
            OpKind::Identity | OpKind::StopGradient => match self.input_value(node, 0) {
                Some(v) => v.clone(),
                None => return Ok(None),
            },
            OpKind::Cast => match self.input_value(node, 0) {
                Some(v) => v.clone().cast(dtype),
                None => return Ok(None),
            },
            OpKind::TensorArraySizeV3 => {
                match self.input(node, 0).and_then(|t| self.tensor_array_sizes.get(&t.node)) {
                    Some(v) => v.clone(),
                    None => return Ok(None),
                }
            }
            OpKind::StridedSlice => {
                let Some(vals) = self.input_values(node) else { return Ok(None) };
                let [input, begin, end, strides] = vals.as_slice() else {
                    return Err(ShapeError::invalid("StridedSlice", "expected 4 inputs"));
                };
                let dims = input.shape().dims.unwrap_or_default();
                let plan = ShapeEngine::slice_plan(
                    &dims,
                    &begin.as_i64s(),
                    &end.as_i64s(),
                    &strides.as_i64s(),
                    Self::slice_masks(node),
                )?;
                match ShapeEngine::slice_value(input, &plan) {
                    Some(v) => v,
                    None => return Ok(None),
                }
            }
            OpKind::Range => {
                let Some(vals) = self.input_values(node) else { return Ok(None) };
                let [start, limit, delta] = vals.as_slice() else {
                    return Err(ShapeError::invalid("Range", "expected 3 inputs"));
                };
                ShapeEngine::range_values(start, limit, delta, dtype)?
            }
            OpKind::Pack => {
                let Some(vals) = self.input_values(node) else { return Ok(None) };
                ShapeEngine::pack_values(&vals, node.attr_int("axis").unwrap_or(0))?.cast(dtype)
            }
            OpKind::Prod => {
                let Some(vals) = self.input_values(node) else { return Ok(None) };
                let [input, axes] = vals.as_slice() else {
                    return Err(ShapeError::invalid("Prod", "expected 2 inputs"));
                };
                let keep = node.attr_bool("keep_dims").unwrap_or(false);
                ShapeEngine::prod_values(input, &axes.as_i64s(), keep)?.cast(dtype)
            }
            OpKind::Mul => {
                let Some(vals) = self.input_values(node) else { return Ok(None) };
                let [a, b] = vals.as_slice() else {
                    return Err(ShapeError::invalid("Mul", "expected 2 inputs"));
                };
                ShapeEngine::mul_values(a, b)?.cast(dtype)
            }
            OpKind::Fill => {
                let Some(vals) = self.input_values(node) else { return Ok(None) };
                let [dims, value] = vals.as_slice() else {
                    return Err(ShapeError::invalid("Fill", "expected 2 inputs"));
                };
                ShapeEngine::fill_values(dims, value)?.cast(dtype)
            }
            _ => return Ok(None),
        };
        debug!(node = %node.name, shape = %value.shape(), "evaluated symbolically");
        Ok(Some(value))
    }

    fn int_value(&self, node: &Node, i: usize) -> Option<Vec<i64>> {
        self.input_value(node, i).map(TensorValue::as_i64s)
    }

    /// Output shapes derivable from input shapes, attributes and any known
    /// input values. Unresolved outputs come back unknown.
    fn shape_fn(&self, node: &Node, inputs: &[Shape]) -> Result<Vec<Shape>, ShapeError> {
        let input = |i: usize| inputs.get(i).cloned().unwrap_or_default();
        let one = |s: Shape| Ok(vec![s]);
        if let Some(segment) = &node.segment {
            return Ok(segment.output_shapes.clone());
        }
        if let Some(v) = self.map.value(&TensorRef::new(node.name.clone(), 0)) {
            return one(v.shape());
        }
        match &node.op {
            op if op.is_unary_elementwise() => one(input(0)),
            op if op.is_binary_broadcast() => one(ShapeEngine::broadcast(&input(0), &input(1))?),
            OpKind::BiasAdd => one(input(0)),
            OpKind::Placeholder => one(node.attr("shape").and_then(AttrValue::as_shape).cloned().unwrap_or_default()),
            OpKind::Const => one(
                node.attr("value")
                    .and_then(AttrValue::as_tensor)
                    .and_then(|t| t.tensor_shape.as_ref())
                    .map(tensor_util::shape_from_proto)
                    .unwrap_or_default(),
            ),
            OpKind::Shape => one(match input(0).rank() {
                Some(r) => Shape::from_dims(&[r]),
                None => Shape::of_rank(1),
            }),
            OpKind::Size | OpKind::Rank | OpKind::TensorArraySizeV3 => one(Shape::scalar()),
            OpKind::Range => one(Shape::of_rank(1)),
            OpKind::Pack => {
                let mut merged = Shape::unknown();
                for s in inputs {
                    merged = merged.merge(s)?;
                }
                match merged.rank() {
                    Some(r) => {
                        let axis = ShapeEngine::normalize_axis(node.attr_int("axis").unwrap_or(0), r + 1, "Pack")?;
                        let mut dims = merged.dims.unwrap_or_default();
                        dims.insert(axis, Dim::Static(inputs.len()));
                        one(Shape { dims: Some(dims) })
                    }
                    None => one(Shape::unknown()),
                }
            }
            OpKind::Fill => one(match self.int_value(node, 0) {
                Some(dims) => Shape::from_i64s(&dims),
                None => input(0).as_static().and_then(|d| d.first().copied()).map_or_else(Shape::unknown, Shape::of_rank),
            }),
            OpKind::Reshape => one(match self.int_value(node, 1) {
                Some(target) => ShapeEngine::reshape(&input(0), &target)?,
                None => input(1).as_static().and_then(|d| d.first().copied()).map_or_else(Shape::unknown, Shape::of_rank),
            }),
            OpKind::StridedSlice => {
                let (Some(begin), Some(end), Some(strides), Some(dims)) =
                    (self.int_value(node, 1), self.int_value(node, 2), self.int_value(node, 3), input(0).dims)
                else {
                    return one(Shape::unknown());
                };
                let plan = ShapeEngine::slice_plan(&dims, &begin, &end, &strides, Self::slice_masks(node))?;
                one(plan.output_shape())
            }
            OpKind::Transpose => one(match self.int_value(node, 1) {
                Some(perm) => ShapeEngine::transpose(&input(0), &perm)?,
                None => input(0).rank().map_or_else(Shape::unknown, Shape::of_rank),
            }),
            OpKind::ExpandDims => one(match self.int_value(node, 1).and_then(|a| a.first().copied()) {
                Some(axis) => ShapeEngine::expand_dims(&input(0), axis)?,
                None => input(0).rank().map_or_else(Shape::unknown, |r| Shape::of_rank(r + 1)),
            }),
            OpKind::Squeeze => {
                let axes = node.attr_ints("squeeze_dims").unwrap_or(&[]);
                one(ShapeEngine::squeeze(&input(0), axes)?)
            }
            OpKind::ConcatV2 => {
                let n = inputs.len().saturating_sub(1);
                match self.int_value(node, n).and_then(|a| a.first().copied()) {
                    Some(axis) => one(ShapeEngine::concat(&inputs[..n], axis)?),
                    None => one(inputs.iter().take(n).find_map(Shape::rank).map_or_else(Shape::unknown, Shape::of_rank)),
                }
            }
            op if op.is_reduction() => {
                let keep = node.attr_bool("keep_dims").unwrap_or(false);
                match self.int_value(node, 1) {
                    Some(axes) => one(ShapeEngine::reduce(&input(0), &axes, keep)?),
                    None if keep => one(input(0).rank().map_or_else(Shape::unknown, Shape::of_rank)),
                    None => one(Shape::unknown()),
                }
            }
            OpKind::MatMul => one(ShapeEngine::matmul(
                &input(0),
                &input(1),
                node.attr_bool("transpose_a").unwrap_or(false),
                node.attr_bool("transpose_b").unwrap_or(false),
            )?
            .merge(&Shape::of_rank(2))?),
            OpKind::BatchMatMul | OpKind::BatchMatMulV2 => one(ShapeEngine::matmul(
                &input(0),
                &input(1),
                node.attr_bool("adj_x").unwrap_or(false),
                node.attr_bool("adj_y").unwrap_or(false),
            )?),
            OpKind::FusedBatchNorm | OpKind::FusedBatchNormV3 => {
                let stats = input(1);
                let mut out = vec![input(0), stats.clone(), stats.clone(), stats.clone(), stats];
                if node.op == OpKind::FusedBatchNormV3 {
                    out.push(Shape::unknown());
                }
                Ok(out)
            }
            OpKind::Switch => Ok(vec![input(0), input(0)]),
            OpKind::TensorArrayV3 => Ok(vec![Shape::from_dims(&[2]), Shape::scalar()]),
            OpKind::TensorArrayGatherV3 => {
                let lead = match self.int_value(node, 1) {
                    Some(indices) => Dim::Static(indices.len()),
                    None => input(1).dims.and_then(|d| d.first().copied()).unwrap_or(Dim::Unknown),
                };
                let element = node.attr("element_shape").and_then(AttrValue::as_shape).cloned().unwrap_or_default();
                one(match element.dims {
                    Some(mut dims) => {
                        dims.insert(0, lead);
                        Shape { dims: Some(dims) }
                    }
                    None => Shape::unknown(),
                })
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// Seeds and propagates shapes over `graph`. Only contradictory seeds are
/// errors; failures on individual nodes end up in the report.
pub fn infer_shapes(graph: &Graph, hints: &ShapeHints) -> Result<(ShapeMap, ShapeReport), ShapeError> {
    let mut inference = ShapeInference::new(graph);
    inference.seed(hints)?;
    let passes = inference.run();
    let (map, mut report) = inference.finish();
    report.passes = passes;
    Ok((map, report))
}

/// Execution-based fallback for tensors that symbolic inference left
/// unresolved. Every tensor still unresolved afterwards is reported.
pub fn resolve_runtime_shapes(
    map: &mut ShapeMap,
    needed: &[TensorRef],
    oracle: Option<&dyn ShapeOracle>,
    samples: &HashMap<String, TensorValue>,
    report: &mut ShapeReport,
) -> Result<(), ShapeError> {
    let mut seen = HashSet::new();
    let pending: Vec<TensorRef> = needed
        .iter()
        .filter(|t| !map.is_fully_defined(t) && seen.insert((*t).clone()))
        .cloned()
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    let Some(oracle) = oracle.filter(|_| !samples.is_empty()) else {
        for t in pending {
            warn!(tensor = %t, "cannot infer shape; provide it as a shape hint");
            report.unresolved.push(t);
        }
        return Ok(());
    };

    let (fetchable, unreachable): (Vec<_>, Vec<_>) = pending.into_iter().partition(|t| oracle.is_fetchable(t));
    for t in unreachable {
        warn!(tensor = %t, "cannot infer shape; it is recommended to provide it as a shape hint");
        report.unresolved.push(t);
    }
    if fetchable.is_empty() {
        return Ok(());
    }

    warn!(count = fetchable.len(), "running inference to find shapes");
    match oracle.run(&fetchable, samples) {
        Ok(shapes) if shapes.len() == fetchable.len() => {
            for (t, shape) in fetchable.into_iter().zip(shapes) {
                map.merge_shape(&t, &shape).map_err(|e| e.at_node(&t.node))?;
                if map.is_fully_defined(&t) {
                    report.from_oracle.push(t);
                } else {
                    report.unresolved.push(t);
                }
            }
        }
        Ok(shapes) => {
            warn!(expected = fetchable.len(), got = shapes.len(), "shape oracle returned a mismatched result");
            report.unresolved.extend(fetchable);
        }
        Err(err) => {
            warn!(error = %err, "shape oracle failed");
            report.unresolved.extend(fetchable);
        }
    }
    Ok(())
}
