// Wire form of a computation graph. Op names and options stay untyped here;
// `ir::convert` is the only place that interprets them.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Float16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Int8,
    Uint8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperandDesc {
    pub name: String,
    pub data_type: DataType,
    pub shape: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorJson {
    pub shape: Vec<u32>,
    pub data: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub op: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphJson {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub inputs: Vec<OperandDesc>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub initializers: BTreeMap<String, TensorJson>,
    pub nodes: Vec<Node>,
}

pub fn new_graph_json() -> GraphJson {
    GraphJson {
        name: None,
        inputs: Vec::new(),
        outputs: Vec::new(),
        initializers: BTreeMap::new(),
        nodes: Vec::new(),
    }
}
