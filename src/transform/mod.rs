// Graph rewrites. A transformation performs at most one rewrite per `apply`
// call; `Graph::transform` repeats it until nothing matches.
pub mod move_add_past_conv;
pub mod move_scalar_mul_past_conv;

pub use move_add_past_conv::MoveAddPastConv;
pub use move_scalar_mul_past_conv::MoveScalarMulPastConv;

use crate::ir::{validate_graph, Graph, GraphError, Op, OpKind};
use crate::shape_inference::{infer_shapes, ShapeInferenceError};
use log::debug;
use thiserror::Error;

/// Upper bound on rewrite passes before `transform` gives up.
pub const MAX_PASSES: usize = 4096;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Shape(#[from] ShapeInferenceError),
    #[error("transform '{name}' did not reach a fixed point after {passes} passes")]
    NoFixedPoint { name: &'static str, passes: usize },
}

pub trait Transformation {
    fn name(&self) -> &'static str;

    /// Perform one rewrite. `Ok(false)` means nothing matched, which is the
    /// normal way for a rule to decline.
    fn apply(&self, graph: &mut Graph) -> Result<bool, TransformError>;
}

impl Graph {
    /// Apply `transformation` to a copy of this graph until it reports no
    /// change. `self` is never touched, so a failure leaves nothing
    /// half-rewritten.
    pub fn transform(&self, transformation: &dyn Transformation) -> Result<Graph, TransformError> {
        validate_graph(self)?;
        let mut graph = self.clone();
        infer_shapes(&mut graph)?;
        let mut passes = 0;
        while transformation.apply(&mut graph)? {
            passes += 1;
            infer_shapes(&mut graph)?;
            if passes >= MAX_PASSES {
                return Err(TransformError::NoFixedPoint {
                    name: transformation.name(),
                    passes,
                });
            }
        }
        if passes > 0 {
            validate_graph(&graph)?;
        }
        debug!("{}: {} rewrite(s)", transformation.name(), passes);
        Ok(graph)
    }
}

/// A scalar-op node directly feeding the data input of a convolution.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ConvPair {
    pub op_idx: usize,
    pub conv_idx: usize,
    /// Input slot of the scalar op holding the non-constant operand.
    pub data_slot: usize,
    pub constant: String,
}

/// Structural match shared by the scalar-op rules: `node[idx]` is of `kind`,
/// reads exactly one non-constant value whose shape it keeps, its output is
/// read only by a single Conv (as data input) and is not a graph output, and
/// that Conv's other inputs are constants.
pub(crate) fn match_op_before_conv(graph: &Graph, idx: usize, kind: OpKind) -> Option<ConvPair> {
    let node = &graph.nodes[idx];
    if node.op.kind() != kind {
        return None;
    }
    if graph.is_join_node(idx) {
        debug!("{}: join node, both operands are dynamic", node.name);
        return None;
    }
    if graph.is_fork_node(idx) {
        debug!("{}: fork node, output has several consumers", node.name);
        return None;
    }

    let data_slot = match (
        graph.is_initializer(&node.inputs[0]),
        graph.is_initializer(&node.inputs[1]),
    ) {
        (false, true) => 0,
        (true, false) => 1,
        _ => {
            debug!("{}: needs exactly one constant operand", node.name);
            return None;
        }
    };

    let out = &node.outputs[0];
    let data_shape = graph.tensor_shape(&node.inputs[data_slot]);
    if data_shape.is_none() || data_shape != graph.tensor_shape(out) {
        debug!(
            "{}: constant operand broadcasts the data from {:?} to {:?}",
            node.name,
            data_shape,
            graph.tensor_shape(out)
        );
        return None;
    }
    if graph.is_graph_output(out) {
        debug!("{}: output '{}' is a graph output", node.name, out);
        return None;
    }
    let Some(conv_idx) = graph.find_consumer(out) else {
        debug!("{}: output '{}' does not have a single consumer", node.name, out);
        return None;
    };

    let conv = &graph.nodes[conv_idx];
    if !matches!(conv.op, Op::Conv(_)) {
        return None;
    }
    if conv.inputs[0] != *out || conv.inputs[1..].iter().any(|i| !graph.is_initializer(i)) {
        debug!("{}: consumer '{}' is not a plain Conv on its data input", node.name, conv.name);
        return None;
    }

    Some(ConvPair {
        op_idx: idx,
        conv_idx,
        data_slot,
        constant: node.inputs[1 - data_slot].clone(),
    })
}

/// Swap the scalar op and its Conv consumer. Value names are reused so the
/// rest of the graph is untouched: the Conv now writes the old scalar-op
/// output and the scalar op writes the old Conv output.
pub(crate) fn move_past_conv(graph: &mut Graph, pair: &ConvPair) {
    let start = graph.nodes[pair.op_idx].inputs[pair.data_slot].clone();
    let between = graph.nodes[pair.op_idx].outputs[0].clone();
    let end = graph.nodes[pair.conv_idx].outputs[0].clone();

    let conv = &mut graph.nodes[pair.conv_idx];
    conv.inputs[0] = start;
    conv.outputs[0] = between.clone();

    let op = &mut graph.nodes[pair.op_idx];
    op.inputs[pair.data_slot] = between;
    op.outputs[0] = end;

    // Topological order puts the conv after the op; once the op is removed
    // the conv sits at conv_idx - 1, so conv_idx is the slot right after it.
    let node = graph.nodes.remove(pair.op_idx);
    graph.nodes.insert(pair.conv_idx, node);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ConvAttrs, GraphBuilder, Node, ValueDecl};
    use ndarray::{ArrayD, IxDyn};

    fn graph(op: Op, scalar_first: bool) -> Graph {
        let inputs: &[&str] = if scalar_first { &["s", "x"] } else { &["x", "s"] };
        GraphBuilder::new("g")
            .input("x", &[1, 1, 4, 4])
            .output("y")
            .initializer("s", ArrayD::from_elem(IxDyn(&[1]), 2.0))
            .initializer("w", ArrayD::from_elem(IxDyn(&[1, 1, 3, 3]), 1.0))
            .node(op, inputs, &["t"])
            .node(Op::Relu, &["x"], &["r"])
            .node(Op::Conv(ConvAttrs::new([3, 3])), &["t", "w"], &["y"])
            .build()
            .unwrap()
    }

    #[test]
    fn match_finds_conv_consumer_in_either_operand_order() {
        let g = graph(Op::Mul, false);
        let pair = match_op_before_conv(&g, 0, OpKind::Mul).unwrap();
        assert_eq!(pair.conv_idx, 2);
        assert_eq!(pair.data_slot, 0);
        assert_eq!(pair.constant, "s");

        let g = graph(Op::Mul, true);
        let pair = match_op_before_conv(&g, 0, OpKind::Mul).unwrap();
        assert_eq!(pair.data_slot, 1);
        assert!(match_op_before_conv(&g, 0, OpKind::Add).is_none());
    }

    #[test]
    fn move_places_op_right_after_conv() {
        let mut g = graph(Op::Mul, false);
        let pair = match_op_before_conv(&g, 0, OpKind::Mul).unwrap();
        move_past_conv(&mut g, &pair);
        assert_eq!(g.op_kinds(), vec![OpKind::Relu, OpKind::Conv, OpKind::Mul]);
        assert_eq!(g.nodes[1].inputs, vec!["x", "w"]);
        assert_eq!(g.nodes[1].outputs, vec!["t"]);
        assert_eq!(g.nodes[2].inputs, vec!["t", "s"]);
        assert_eq!(g.nodes[2].outputs, vec!["y"]);
        validate_graph(&g).unwrap();
    }

    #[test]
    fn transform_rejects_unsorted_input() {
        let mut g = Graph::new("g");
        g.inputs.push(ValueDecl {
            name: "x".to_string(),
            shape: vec![1, 1, 4, 4],
        });
        g.outputs.push("y".to_string());
        g.initializers
            .insert("s".to_string(), ArrayD::from_elem(IxDyn(&[1]), 2.0));
        g.initializers
            .insert("w".to_string(), ArrayD::from_elem(IxDyn(&[1, 1, 3, 3]), 1.0));
        g.nodes = vec![
            Node {
                name: "conv".to_string(),
                op: Op::Conv(ConvAttrs::new([3, 3])),
                inputs: vec!["t".to_string(), "w".to_string()],
                outputs: vec!["y".to_string()],
            },
            Node {
                name: "mul".to_string(),
                op: Op::Mul,
                inputs: vec!["x".to_string(), "s".to_string()],
                outputs: vec!["t".to_string()],
            },
        ];

        let res = g.transform(&crate::transform::MoveScalarMulPastConv);
        assert!(matches!(
            res,
            Err(TransformError::Graph(GraphError::NotTopological { .. }))
        ));
    }
}
