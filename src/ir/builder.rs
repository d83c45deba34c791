use crate::ir::{Graph, GraphError, Node, Op, Tensor, ValueDecl};

/// Programmatic graph construction. Nodes may be added in any order;
/// `build` sorts them and runs validation and shape inference.
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            graph: Graph::new(name),
        }
    }

    pub fn input(mut self, name: &str, shape: &[usize]) -> Self {
        self.graph.inputs.push(ValueDecl {
            name: name.to_string(),
            shape: shape.to_vec(),
        });
        self
    }

    pub fn output(mut self, name: &str) -> Self {
        self.graph.outputs.push(name.to_string());
        self
    }

    pub fn initializer(mut self, name: &str, tensor: Tensor) -> Self {
        self.graph.initializers.insert(name.to_string(), tensor);
        self
    }

    /// Adds a node named `<Kind>_<position>`.
    pub fn node(mut self, op: Op, inputs: &[&str], outputs: &[&str]) -> Self {
        let name = format!("{}_{}", op.kind(), self.graph.nodes.len());
        self.graph.nodes.push(Node {
            name,
            op,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn build(self) -> Result<Graph, GraphError> {
        self.graph.into_checked()
    }
}
