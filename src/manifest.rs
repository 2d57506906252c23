use crate::compiler::CompilerOptions;
use crate::core::types::{DataType, Shape, TensorValue, element_count};
use crate::execution_plan::PlanPolicy;
use crate::partitioner::PartitionConfig;
use crate::shape_inference::ShapeHints;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Sample value fed to the execution fallback.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SampleTensor {
    pub dtype: DataType,
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl SampleTensor {
    pub fn to_value(&self) -> anyhow::Result<TensorValue> {
        let count = element_count(&self.shape)
            .ok_or_else(|| anyhow::anyhow!("sample shape {:?} is too large", self.shape))?;
        anyhow::ensure!(
            self.values.len() == count,
            "sample has {} values but shape {:?} needs {}",
            self.values.len(),
            self.shape,
            count
        );
        Ok(if self.dtype.is_float() {
            TensorValue::floats(self.dtype, self.shape.clone(), self.values.clone())
        } else {
            TensorValue::ints(self.dtype, self.shape.clone(), self.values.iter().map(|v| *v as i64).collect())
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CompilerConfig {
    pub program: PathBuf,
    pub program_args: Vec<String>,
    pub extra_args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub timeout_secs: u64,
    pub max_workers: Option<usize>,
    pub memory_per_worker_bytes: u64,
    pub grace_period_ms: u64,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        let options = CompilerOptions::default();
        Self {
            program: options.program,
            program_args: options.program_args,
            extra_args: options.extra_args,
            workdir: options.workdir,
            timeout_secs: options.timeout.as_secs(),
            max_workers: options.max_workers,
            memory_per_worker_bytes: options.memory_per_worker,
            grace_period_ms: options.grace_period.as_millis() as u64,
        }
    }
}

impl CompilerConfig {
    pub fn options(&self) -> CompilerOptions {
        CompilerOptions {
            program: self.program.clone(),
            program_args: self.program_args.clone(),
            extra_args: self.extra_args.clone(),
            workdir: self.workdir.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            max_workers: self.max_workers,
            memory_per_worker: self.memory_per_worker_bytes,
            grace_period: Duration::from_millis(self.grace_period_ms),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Manifest {
    /// Serialized input graph; used by the binary only.
    pub graph: Option<PathBuf>,
    /// Where the binary writes the transformed graph.
    pub output: Option<PathBuf>,
    pub inputs: Option<Vec<String>>,
    pub outputs: Option<Vec<String>>,
    pub op_whitelist: Vec<String>,
    pub no_fuse_ops: Vec<String>,
    pub force_fuse_ops: Vec<String>,
    pub minimum_segment_size: Option<usize>,
    /// Tensor name to dims, `-1` for unknown.
    pub shape_hints: HashMap<String, Vec<i64>>,
    /// Tensor name to a known value, seeded before propagation.
    pub value_hints: HashMap<String, SampleTensor>,
    pub sample_inputs: HashMap<String, SampleTensor>,
    pub compiler: CompilerConfig,
    /// Unfuse segments that failed to compile instead of aborting.
    pub recovery: bool,
    pub fold_shape_ops: bool,
    /// Mark batch axes on every compiled segment, as opposed to enabling a
    /// dynamic batch size only when every segment supports it.
    pub dynamic_batch_size: bool,
    pub plan: PlanPolicy,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            graph: None,
            output: None,
            inputs: None,
            outputs: None,
            op_whitelist: Vec::new(),
            no_fuse_ops: Vec::new(),
            force_fuse_ops: Vec::new(),
            minimum_segment_size: None,
            shape_hints: HashMap::new(),
            value_hints: HashMap::new(),
            sample_inputs: HashMap::new(),
            compiler: CompilerConfig::default(),
            recovery: true,
            fold_shape_ops: true,
            dynamic_batch_size: false,
            plan: PlanPolicy::default(),
        }
    }
}

impl Manifest {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn partition_config(&self) -> PartitionConfig {
        PartitionConfig {
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            op_whitelist: self.op_whitelist.iter().cloned().collect(),
            no_fuse_ops: self.no_fuse_ops.iter().cloned().collect(),
            force_fuse_ops: self.force_fuse_ops.iter().cloned().collect(),
            minimum_segment_size: self.minimum_segment_size,
        }
    }

    pub fn shape_hints(&self) -> anyhow::Result<ShapeHints> {
        Ok(ShapeHints {
            shapes: self.shape_hints.iter().map(|(k, dims)| (k.clone(), Shape::from_i64s(dims))).collect(),
            values: convert_samples(&self.value_hints, "value hint")?,
        })
    }

    pub fn samples(&self) -> anyhow::Result<HashMap<String, TensorValue>> {
        convert_samples(&self.sample_inputs, "sample input")
    }
}

fn convert_samples(samples: &HashMap<String, SampleTensor>, what: &str) -> anyhow::Result<HashMap<String, TensorValue>> {
    samples
        .iter()
        .map(|(name, sample)| {
            let value = sample.to_value().map_err(|e| e.context(format!("{what} '{name}'")))?;
            Ok((name.clone(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let m = Manifest::from_json(r#"{ "op_whitelist": ["Add", "Relu"] }"#).unwrap();
        assert!(m.recovery);
        assert_eq!(m.compiler.timeout_secs, 18000);
        assert_eq!(m.plan, PlanPolicy::default());
        let cfg = m.partition_config();
        assert!(cfg.op_whitelist.contains("Relu"));
        assert_eq!(cfg.minimum_segment_size, None);
    }

    #[test]
    fn hints_and_samples_convert() {
        let m = Manifest::from_json(
            r#"{
                "shape_hints": { "x:0": [-1, 3] },
                "sample_inputs": { "x:0": { "dtype": "float32", "shape": [1, 3], "values": [1, 2, 3] } },
                "compiler": { "program": "/opt/cc", "timeout_secs": 5, "max_workers": 2 },
                "plan": { "max_duplicates": 2 }
            }"#,
        )
        .unwrap();
        assert_eq!(m.shape_hints().unwrap().shapes.get("x:0"), Some(&Shape::from_i64s(&[-1, 3])));
        let samples = m.samples().unwrap();
        assert_eq!(samples.get("x:0").map(TensorValue::len), Some(3));
        let options = m.compiler.options();
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert_eq!(options.grace_period, Duration::from_secs(1));
        assert_eq!(m.plan.max_duplicates, 2);
        assert_eq!(m.plan.min_timeout_secs, 10);
    }

    #[test]
    fn mismatched_sample_is_rejected() {
        let m = Manifest::from_json(
            r#"{ "sample_inputs": { "x": { "dtype": "int32", "shape": [2], "values": [1] } } }"#,
        )
        .unwrap();
        assert!(m.samples().is_err());
    }

    #[test]
    fn value_hints_become_seed_values() {
        let m = Manifest::from_json(
            r#"{
                "value_hints": { "dims:0": { "dtype": "int32", "shape": [2], "values": [4, 8] } },
                "dynamic_batch_size": true
            }"#,
        )
        .unwrap();
        assert!(m.dynamic_batch_size);
        let hints = m.shape_hints().unwrap();
        assert_eq!(hints.values.get("dims:0").map(TensorValue::as_i64s), Some(vec![4, 8]));
        assert!(hints.shapes.is_empty());

        let bad = Manifest::from_json(
            r#"{ "value_hints": { "d": { "dtype": "int32", "shape": [4294967296, 4294967296], "values": [] } } }"#,
        )
        .unwrap();
        assert!(bad.shape_hints().is_err());
    }
}
