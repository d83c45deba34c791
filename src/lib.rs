pub mod ast;
pub mod config;
pub mod equivalence;
pub mod exec;
pub mod folding;
pub mod ir;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod shape_inference;
pub mod streamline;
pub mod transform;
