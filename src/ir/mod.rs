// Typed computation graph. Op kinds form a closed enum with per-kind
// attributes; string op names only exist in the wire form (`crate::ast`).
pub mod builder;
pub mod convert;
pub mod validate;

use crate::ast::DataType;
use crate::shape_inference::{infer_shapes, ShapeInferenceError};
use ndarray::ArrayD;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

pub use builder::GraphBuilder;
pub use convert::{graph_from_json, graph_to_json};
pub use validate::{sort_topologically, validate_graph};

/// Dense float tensor used for initializers and execution values.
pub type Tensor = ArrayD<f32>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("unsupported op '{op}' at node '{node}'")]
    UnsupportedOp { op: String, node: String },
    #[error("value '{name}' has unsupported data type {data_type:?}")]
    UnsupportedDataType { name: String, data_type: DataType },
    #[error("missing attribute '{attr}' on node '{node}'")]
    MissingAttribute { attr: String, node: String },
    #[error("invalid attribute '{attr}' on node '{node}': {reason}")]
    InvalidAttribute {
        attr: String,
        node: String,
        reason: String,
    },
    #[error("unsupported value {value} for attribute '{attr}' on node '{node}'")]
    UnsupportedAttribute {
        attr: String,
        node: String,
        value: String,
    },
    #[error("invalid initializer '{name}': {reason}")]
    InvalidInitializer { name: String, reason: String },
    #[error("{op} node '{node}' expects {expected}, got {got}")]
    Arity {
        node: String,
        op: OpKind,
        expected: &'static str,
        got: usize,
    },
    #[error("value '{0}' is produced more than once")]
    DuplicateProducer(String),
    #[error("node '{node}' reads '{value}' which is never produced")]
    DanglingReference { node: String, value: String },
    #[error("node '{node}' reads '{value}' before it is produced")]
    NotTopological { node: String, value: String },
    #[error("graph output '{0}' is never produced")]
    UndefinedOutput(String),
    #[error("graph contains a cycle through nodes {0:?}")]
    Cycle(Vec<String>),
    #[error("node '{node}' requires '{value}' to be an initializer")]
    MissingInitializer { node: String, value: String },
    #[error("invalid weights for node '{node}': {reason}")]
    InvalidWeights { node: String, reason: String },
    #[error(transparent)]
    Shape(#[from] ShapeInferenceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Add,
    Mul,
    Relu,
    Conv,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Add => "Add",
            OpKind::Mul => "Mul",
            OpKind::Relu => "Relu",
            OpKind::Conv => "Conv",
        }
    }

    pub fn parse(op_type: &str) -> Option<Self> {
        match op_type {
            "Add" => Some(OpKind::Add),
            "Mul" => Some(OpKind::Mul),
            "Relu" => Some(OpKind::Relu),
            "Conv" => Some(OpKind::Conv),
            _ => None,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 2D convolution attributes. `pads` follows the ONNX order
/// `[top, left, bottom, right]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvAttrs {
    pub kernel_shape: [usize; 2],
    pub pads: [usize; 4],
    pub strides: [usize; 2],
    pub dilations: [usize; 2],
    pub group: usize,
}

impl ConvAttrs {
    pub fn new(kernel_shape: [usize; 2]) -> Self {
        Self {
            kernel_shape,
            pads: [0; 4],
            strides: [1, 1],
            dilations: [1, 1],
            group: 1,
        }
    }

    pub fn with_pads(mut self, pads: [usize; 4]) -> Self {
        self.pads = pads;
        self
    }

    pub fn with_strides(mut self, strides: [usize; 2]) -> Self {
        self.strides = strides;
        self
    }

    pub fn with_dilations(mut self, dilations: [usize; 2]) -> Self {
        self.dilations = dilations;
        self
    }

    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    pub fn has_padding(&self) -> bool {
        self.pads.iter().any(|&p| p != 0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Add,
    Mul,
    Relu,
    Conv(ConvAttrs),
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Add => OpKind::Add,
            Op::Mul => OpKind::Mul,
            Op::Relu => OpKind::Relu,
            Op::Conv(_) => OpKind::Conv,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub op: Op,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueDecl {
    pub name: String,
    pub shape: Vec<usize>,
}

/// A graph whose node list is kept in topological order.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    pub name: String,
    pub inputs: Vec<ValueDecl>,
    pub outputs: Vec<String>,
    pub nodes: Vec<Node>,
    pub initializers: HashMap<String, Tensor>,
    /// Filled by shape inference.
    pub value_shapes: HashMap<String, Vec<usize>>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            nodes: Vec::new(),
            initializers: HashMap::new(),
            value_shapes: HashMap::new(),
        }
    }

    /// Sort, validate and infer shapes. Every graph handed to a
    /// transformation or the executor goes through here first.
    pub fn into_checked(mut self) -> Result<Graph, GraphError> {
        sort_topologically(&mut self)?;
        validate_graph(&self)?;
        infer_shapes(&mut self)?;
        Ok(self)
    }

    pub fn op_kinds(&self) -> Vec<OpKind> {
        self.nodes.iter().map(|n| n.op.kind()).collect()
    }

    pub fn initializer(&self, name: &str) -> Option<&Tensor> {
        self.initializers.get(name)
    }

    pub fn is_initializer(&self, name: &str) -> bool {
        self.initializers.contains_key(name)
    }

    pub fn is_graph_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|i| i.name == name)
    }

    pub fn is_graph_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o == name)
    }

    pub fn tensor_shape(&self, name: &str) -> Option<&[usize]> {
        self.value_shapes.get(name).map(|s| s.as_slice())
    }

    pub fn producer_index(&self, value: &str) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.outputs.iter().any(|o| o == value))
    }

    pub fn consumer_indices(&self, value: &str) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.inputs.iter().any(|i| i == value))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// The single consumer of `value`, or `None` when it has zero or several.
    pub fn find_consumer(&self, value: &str) -> Option<usize> {
        match self.consumer_indices(value).as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// True when any output of the node feeds more than one consumer.
    pub fn is_fork_node(&self, idx: usize) -> bool {
        self.nodes[idx]
            .outputs
            .iter()
            .any(|o| self.consumer_indices(o).len() > 1)
    }

    /// True when the node reads more than one non-constant value.
    pub fn is_join_node(&self, idx: usize) -> bool {
        self.nodes[idx]
            .inputs
            .iter()
            .filter(|i| !self.is_initializer(i))
            .count()
            > 1
    }

    /// A value name derived from `base` that no input, output, node value or
    /// initializer uses yet.
    pub fn unique_name(&self, base: &str) -> String {
        let taken = |candidate: &str| {
            self.is_initializer(candidate)
                || self.is_graph_input(candidate)
                || self
                    .nodes
                    .iter()
                    .any(|n| n.inputs.iter().chain(&n.outputs).any(|v| v == candidate))
        };
        let mut idx = 0usize;
        loop {
            let candidate = format!("{}_{}", base, idx);
            if !taken(&candidate) {
                return candidate;
            }
            idx += 1;
        }
    }
}
