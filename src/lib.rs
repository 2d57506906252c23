pub mod batch_axis;
pub mod compiler;
pub mod constants;
pub mod core;
pub mod error;
pub mod execution_plan;
pub mod graph;
pub mod manifest;
pub mod partitioner;
pub mod passes;
pub mod pipeline;
pub mod recovery;
pub mod segment;
pub mod shape_engine;
pub mod shape_inference;
pub mod tensor_util;
pub mod wire;
