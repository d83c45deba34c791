// Structural well-formedness. A graph that fails here is a precondition
// violation for every later stage; nothing downstream tries to repair it.
use crate::ir::{ConvAttrs, Graph, GraphError, Node, Op, OpKind};
use std::collections::{HashMap, HashSet};

/// Reorder `graph.nodes` topologically, keeping the existing relative order
/// wherever the data dependencies allow it.
pub fn sort_topologically(graph: &mut Graph) -> Result<(), GraphError> {
    let producers = collect_producers(graph)?;

    for node in &graph.nodes {
        for input in &node.inputs {
            if !is_source(graph, input) && !producers.contains_key(input.as_str()) {
                return Err(GraphError::DanglingReference {
                    node: node.name.clone(),
                    value: input.clone(),
                });
            }
        }
    }

    let mut available: HashSet<String> = graph
        .inputs
        .iter()
        .map(|i| i.name.clone())
        .chain(graph.initializers.keys().cloned())
        .collect();
    let mut pending: Vec<Node> = std::mem::take(&mut graph.nodes);
    let mut sorted = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let ready = pending
            .iter()
            .position(|n| n.inputs.iter().all(|i| available.contains(i)));
        match ready {
            Some(idx) => {
                let node = pending.remove(idx);
                available.extend(node.outputs.iter().cloned());
                sorted.push(node);
            }
            None => {
                let names = pending.iter().map(|n| n.name.clone()).collect();
                // Leave the graph as it was.
                sorted.extend(pending);
                graph.nodes = sorted;
                return Err(GraphError::Cycle(names));
            }
        }
    }

    graph.nodes = sorted;
    Ok(())
}

/// Check producers, ordering, per-op arity and constant operands.
pub fn validate_graph(graph: &Graph) -> Result<(), GraphError> {
    collect_producers(graph)?;

    let mut available: HashSet<&str> = graph
        .inputs
        .iter()
        .map(|i| i.name.as_str())
        .chain(graph.initializers.keys().map(|k| k.as_str()))
        .collect();
    let all_outputs: HashSet<&str> = graph
        .nodes
        .iter()
        .flat_map(|n| n.outputs.iter().map(|o| o.as_str()))
        .collect();

    for node in &graph.nodes {
        for input in &node.inputs {
            if available.contains(input.as_str()) {
                continue;
            }
            if all_outputs.contains(input.as_str()) {
                return Err(GraphError::NotTopological {
                    node: node.name.clone(),
                    value: input.clone(),
                });
            }
            return Err(GraphError::DanglingReference {
                node: node.name.clone(),
                value: input.clone(),
            });
        }
        check_arity(node)?;
        if let Op::Conv(attrs) = &node.op {
            check_conv_operands(graph, node, attrs)?;
        }
        available.extend(node.outputs.iter().map(|o| o.as_str()));
    }

    for output in &graph.outputs {
        if !available.contains(output.as_str()) {
            return Err(GraphError::UndefinedOutput(output.clone()));
        }
    }

    Ok(())
}

fn is_source(graph: &Graph, value: &str) -> bool {
    graph.is_graph_input(value) || graph.is_initializer(value)
}

fn collect_producers(graph: &Graph) -> Result<HashMap<&str, usize>, GraphError> {
    let mut producers = HashMap::new();
    for (idx, node) in graph.nodes.iter().enumerate() {
        for output in &node.outputs {
            if is_source(graph, output) || producers.insert(output.as_str(), idx).is_some() {
                return Err(GraphError::DuplicateProducer(output.clone()));
            }
        }
    }
    Ok(producers)
}

fn check_arity(node: &Node) -> Result<(), GraphError> {
    let kind = node.op.kind();
    let (ok, expected) = match kind {
        OpKind::Add | OpKind::Mul => (node.inputs.len() == 2, "2 inputs"),
        OpKind::Relu => (node.inputs.len() == 1, "1 input"),
        OpKind::Conv => (
            (2..=3).contains(&node.inputs.len()),
            "2 or 3 inputs (data, weights, optional bias)",
        ),
    };
    if !ok {
        return Err(GraphError::Arity {
            node: node.name.clone(),
            op: kind,
            expected,
            got: node.inputs.len(),
        });
    }
    if node.outputs.len() != 1 {
        return Err(GraphError::Arity {
            node: node.name.clone(),
            op: kind,
            expected: "1 output",
            got: node.outputs.len(),
        });
    }
    Ok(())
}

fn check_conv_operands(
    graph: &Graph,
    node: &Node,
    attrs: &ConvAttrs,
) -> Result<(), GraphError> {
    for (attr, values) in [("strides", attrs.strides), ("dilations", attrs.dilations)] {
        if values.contains(&0) {
            return Err(GraphError::InvalidAttribute {
                attr: attr.to_string(),
                node: node.name.clone(),
                reason: format!("must be positive, got {:?}", values),
            });
        }
    }
    let kernel_shape = attrs.kernel_shape;
    let group = attrs.group;
    let weights_name = &node.inputs[1];
    let weights = graph
        .initializer(weights_name)
        .ok_or_else(|| GraphError::MissingInitializer {
            node: node.name.clone(),
            value: weights_name.clone(),
        })?;
    let shape = weights.shape();
    if shape.len() != 4 {
        return Err(GraphError::InvalidWeights {
            node: node.name.clone(),
            reason: format!("expected rank-4 weights, got shape {:?}", shape),
        });
    }
    if shape[2..] != kernel_shape[..] {
        return Err(GraphError::InvalidWeights {
            node: node.name.clone(),
            reason: format!(
                "weights shape {:?} does not match kernel_shape {:?}",
                shape, kernel_shape
            ),
        });
    }
    if group == 0 || shape[0] % group != 0 {
        return Err(GraphError::InvalidWeights {
            node: node.name.clone(),
            reason: format!("{} output channels not divisible by group {}", shape[0], group),
        });
    }

    if let Some(bias_name) = node.inputs.get(2) {
        let bias = graph
            .initializer(bias_name)
            .ok_or_else(|| GraphError::MissingInitializer {
                node: node.name.clone(),
                value: bias_name.clone(),
            })?;
        if bias.shape() != [shape[0]] {
            return Err(GraphError::InvalidWeights {
                node: node.name.clone(),
                reason: format!(
                    "bias shape {:?} does not match {} output channels",
                    bias.shape(),
                    shape[0]
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, ValueDecl};
    use ndarray::{ArrayD, IxDyn};

    fn node(name: &str, op: Op, inputs: &[&str], outputs: &[&str]) -> Node {
        Node {
            name: name.to_string(),
            op,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn graph_with(nodes: Vec<Node>) -> Graph {
        let mut g = Graph::new("t");
        g.inputs.push(ValueDecl {
            name: "x".to_string(),
            shape: vec![1, 1, 3, 3],
        });
        g.outputs.push("y".to_string());
        g.nodes = nodes;
        g
    }

    #[test]
    fn detects_cycle() {
        let mut g = graph_with(vec![
            node("a", Op::Add, &["x", "c"], &["b"]),
            node("r", Op::Relu, &["b"], &["c"]),
            node("out", Op::Relu, &["c"], &["y"]),
        ]);
        let err = sort_topologically(&mut g).unwrap_err();
        assert!(matches!(err, GraphError::Cycle(ref names) if names.len() == 3));
        assert_eq!(g.nodes.len(), 3);
    }

    #[test]
    fn unsorted_graph_fails_validation_but_sorts() {
        let mut g = graph_with(vec![
            node("second", Op::Relu, &["a"], &["y"]),
            node("first", Op::Relu, &["x"], &["a"]),
        ]);
        assert!(matches!(
            validate_graph(&g),
            Err(GraphError::NotTopological { .. })
        ));
        sort_topologically(&mut g).unwrap();
        validate_graph(&g).unwrap();
        assert_eq!(g.nodes[0].name, "first");
    }

    #[test]
    fn rejects_double_producer() {
        let g = graph_with(vec![
            node("a", Op::Relu, &["x"], &["y"]),
            node("b", Op::Relu, &["x"], &["y"]),
        ]);
        assert!(matches!(
            validate_graph(&g),
            Err(GraphError::DuplicateProducer(v)) if v == "y"
        ));
    }

    #[test]
    fn conv_weights_must_be_constant() {
        let g = graph_with(vec![node(
            "c",
            Op::Conv(ConvAttrs::new([3, 3])),
            &["x", "x"],
            &["y"],
        )]);
        assert!(matches!(
            validate_graph(&g),
            Err(GraphError::MissingInitializer { .. })
        ));
    }

    #[test]
    fn conv_kernel_shape_must_match_weights() {
        let mut g = graph_with(vec![node(
            "c",
            Op::Conv(ConvAttrs::new([3, 3])),
            &["x", "w"],
            &["y"],
        )]);
        g.initializers
            .insert("w".to_string(), ArrayD::zeros(IxDyn(&[1, 1, 2, 2])));
        assert!(matches!(
            validate_graph(&g),
            Err(GraphError::InvalidWeights { .. })
        ));
    }

    #[test]
    fn relu_arity_is_checked() {
        let g = graph_with(vec![node("r", Op::Relu, &["x", "x"], &["y"])]);
        assert!(matches!(
            validate_graph(&g),
            Err(GraphError::Arity { got: 2, .. })
        ));
    }

    #[test]
    fn zero_stride_or_dilation_is_rejected() {
        for attrs in [
            ConvAttrs::new([3, 3]).with_strides([0, 1]),
            ConvAttrs::new([3, 3]).with_dilations([1, 0]),
        ] {
            let res = GraphBuilder::new("g")
                .input("x", &[1, 1, 5, 5])
                .output("y")
                .initializer("w", ArrayD::zeros(IxDyn(&[1, 1, 3, 3])))
                .node(Op::Conv(attrs), &["x", "w"], &["y"])
                .build();
            assert!(matches!(
                res,
                Err(GraphError::InvalidAttribute { ref attr, .. })
                    if attr == "strides" || attr == "dilations"
            ));
        }
    }
}
