use crate::batch_axis;
use crate::compiler::{CompileReport, compile_segments};
use crate::constants::{self, ConstantStore};
use crate::core::types::TensorRef;
use crate::execution_plan::set_execution_plan;
use crate::graph::Graph;
use crate::manifest::Manifest;
use crate::partitioner::{PartitionReport, whitelist_partition};
use crate::passes::{self, OpCounts};
use crate::recovery::{RecoveryReport, ensure_compiled, restore_compiler_failures};
use crate::segment::source_tensor;
use crate::shape_inference::{
    ShapeHints, ShapeMap, ShapeOracle, ShapeReport, infer_shapes, resolve_runtime_shapes,
};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub struct CompilerContext {
    pub manifest: Manifest,
    pub graph: Graph,
    pub oracle: Option<Box<dyn ShapeOracle>>,

    pub constants: ConstantStore,
    pub shapes: ShapeMap,
    /// Shapes as declared by the graph itself, without hints.
    pub declared_shapes: ShapeMap,
    pub shape_report: ShapeReport,
    pub partition: PartitionReport,
    pub compile: CompileReport,
    pub recovery: RecoveryReport,
    pub dynamic_batch: bool,
    pub renames: BTreeMap<String, String>,
    pub op_counts: OpCounts,
}

impl CompilerContext {
    pub fn new(graph: Graph, manifest: Manifest) -> Self {
        Self {
            manifest,
            graph,
            oracle: None,
            constants: ConstantStore::default(),
            shapes: ShapeMap::default(),
            declared_shapes: ShapeMap::default(),
            shape_report: ShapeReport::default(),
            partition: PartitionReport::default(),
            compile: CompileReport::default(),
            recovery: RecoveryReport::default(),
            dynamic_batch: false,
            renames: BTreeMap::new(),
            op_counts: OpCounts::default(),
        }
    }

    pub fn with_oracle(mut self, oracle: Box<dyn ShapeOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }
}

pub trait Stage {
    fn name(&self) -> &str;
    fn run(&self, ctx: &mut CompilerContext) -> anyhow::Result<()>;
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Every stage, in the order the graph has to go through them.
    pub fn standard() -> Self {
        let mut pipeline = Self::new();
        pipeline.add_stage(NormalizeStage);
        pipeline.add_stage(ShapeInferenceStage);
        pipeline.add_stage(PartitionStage);
        pipeline.add_stage(BoundaryShapesStage);
        pipeline.add_stage(CompileStage);
        pipeline.add_stage(RecoveryStage);
        pipeline.add_stage(BatchAxisStage);
        pipeline.add_stage(FinalizeStage);
        pipeline
    }

    pub fn add_stage<S: Stage + 'static>(&mut self, stage: S) {
        self.stages.push(Box::new(stage));
    }

    pub fn execute(&self, ctx: &mut CompilerContext) -> anyhow::Result<()> {
        for stage in &self.stages {
            info!(stage = stage.name(), "running stage");
            stage.run(ctx)?;
        }
        Ok(())
    }
}

/// Operator normalization and large-constant erasure.
pub struct NormalizeStage;

impl Stage for NormalizeStage {
    fn name(&self) -> &str {
        "normalize"
    }

    fn run(&self, ctx: &mut CompilerContext) -> anyhow::Result<()> {
        passes::run_normalize_operators(&mut ctx.graph);
        ctx.constants = constants::run_erase_large_constants(&mut ctx.graph);
        Ok(())
    }
}

pub struct ShapeInferenceStage;

impl Stage for ShapeInferenceStage {
    fn name(&self) -> &str {
        "shape-inference"
    }

    fn run(&self, ctx: &mut CompilerContext) -> anyhow::Result<()> {
        let (declared, _) = infer_shapes(&ctx.graph, &ShapeHints::default())?;
        let (shapes, report) = infer_shapes(&ctx.graph, &ctx.manifest.shape_hints()?)?;
        if ctx.manifest.fold_shape_ops {
            passes::run_fold_shape_ops(&mut ctx.graph, &shapes);
        }
        ctx.shapes = shapes;
        ctx.declared_shapes = declared;
        ctx.shape_report = report;
        Ok(())
    }
}

pub struct PartitionStage;

impl Stage for PartitionStage {
    fn name(&self) -> &str {
        "partition"
    }

    fn run(&self, ctx: &mut CompilerContext) -> anyhow::Result<()> {
        ctx.partition = whitelist_partition(&mut ctx.graph, &ctx.manifest.partition_config())?;
        Ok(())
    }
}

/// Fills segment boundary shapes from the shapes inferred on the graph
/// before partitioning.
pub struct BoundaryShapesStage;

impl Stage for BoundaryShapesStage {
    fn name(&self) -> &str {
        "boundary-shapes"
    }

    fn run(&self, ctx: &mut CompilerContext) -> anyhow::Result<()> {
        let mut boundaries: Vec<(String, Vec<TensorRef>, Vec<TensorRef>)> = Vec::new();
        for node in ctx.graph.nodes() {
            let Some(segment) = node.segment.as_deref() else { continue };
            let inputs = node.data_inputs().map(|t| source_tensor(&ctx.graph, t)).collect();
            boundaries.push((node.name.clone(), inputs, segment.output_names.clone()));
        }
        if boundaries.is_empty() {
            return Ok(());
        }

        let needed: Vec<TensorRef> =
            boundaries.iter().flat_map(|(_, i, o)| i.iter().chain(o.iter()).cloned()).collect();
        let samples = ctx.manifest.samples()?;
        resolve_runtime_shapes(&mut ctx.shapes, &needed, ctx.oracle.as_deref(), &samples, &mut ctx.shape_report)?;

        for (name, inputs, outputs) in boundaries {
            let input_shapes = inputs.iter().map(|t| ctx.shapes.shape(t)).collect();
            let output_shapes = outputs.iter().map(|t| ctx.shapes.shape(t)).collect();
            if let Some(segment) = ctx.graph.node_mut(&name).and_then(|n| n.segment.as_deref_mut()) {
                segment.input_shapes = input_shapes;
                segment.output_shapes = output_shapes;
            }
        }
        Ok(())
    }
}

pub struct CompileStage;

impl Stage for CompileStage {
    fn name(&self) -> &str {
        "compile"
    }

    fn run(&self, ctx: &mut CompilerContext) -> anyhow::Result<()> {
        ctx.compile = compile_segments(&mut ctx.graph, &ctx.manifest.compiler.options(), &ctx.constants)?;
        Ok(())
    }
}

/// Unfuses failed segments, then puts erased constant payloads back.
pub struct RecoveryStage;

impl Stage for RecoveryStage {
    fn name(&self) -> &str {
        "recovery"
    }

    fn run(&self, ctx: &mut CompilerContext) -> anyhow::Result<()> {
        if ctx.manifest.recovery {
            ctx.recovery = restore_compiler_failures(&mut ctx.graph, &ctx.partition.original_controls)?;
        } else {
            warn!("recovery is disabled; segments that failed to compile stay fused");
        }
        ctx.constants.restore(&mut ctx.graph);
        Ok(())
    }
}

/// Batch-axis annotation. With `dynamic_batch_size` every segment is marked
/// from its declared shapes; otherwise a dynamic batch size is enabled only
/// when every segment supports one.
pub struct BatchAxisStage;

impl Stage for BatchAxisStage {
    fn name(&self) -> &str {
        "batch-axis"
    }

    fn run(&self, ctx: &mut CompilerContext) -> anyhow::Result<()> {
        ctx.dynamic_batch = if ctx.manifest.dynamic_batch_size {
            batch_axis::run_mark_batch_axis(&mut ctx.graph, &ctx.declared_shapes);
            true
        } else {
            batch_axis::run_set_dynamic_batch_size(&mut ctx.graph, &ctx.declared_shapes)
        };
        if ctx.dynamic_batch {
            let relaxed = batch_axis::run_relax_placeholder_shapes(&mut ctx.graph);
            info!(relaxed, "placeholder batch dimensions freed");
        }
        Ok(())
    }
}

/// Uncompiled check, namescope renaming, execution plan and statistics.
pub struct FinalizeStage;

impl Stage for FinalizeStage {
    fn name(&self) -> &str {
        "finalize"
    }

    fn run(&self, ctx: &mut CompilerContext) -> anyhow::Result<()> {
        ensure_compiled(&ctx.graph)?;
        ctx.renames = passes::run_rename_by_namescope(&mut ctx.graph)?;
        set_execution_plan(&mut ctx.graph, &ctx.manifest.plan);
        ctx.op_counts = passes::log_op_counts(&ctx.graph);
        Ok(())
    }
}

/// Runs the standard pipeline over `graph`.
pub fn compile_graph(graph: Graph, manifest: Manifest) -> anyhow::Result<CompilerContext> {
    let mut ctx = CompilerContext::new(graph, manifest);
    Pipeline::standard().execute(&mut ctx)?;
    Ok(ctx)
}
