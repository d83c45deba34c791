// ONNX model import. Only the subset the graph IR understands is mapped;
// anything else surfaces as an `UnsupportedOp` when the result is checked.

pub mod import;

pub use import::{import_model, load_onnx_model, OnnxError};
