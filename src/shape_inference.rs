// Static shape inference for typed graphs.
// Shapes are recomputed from scratch on every call: graph inputs and
// initializers seed the table, then nodes are visited in (topological) order.
// Rewrites rely on this to refresh values whose producer changed.
use crate::ir::{ConvAttrs, Graph, Op, OpKind};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShapeInferenceError {
    #[error("value '{0}' is missing shape information")]
    MissingShape(String),
    #[error("node '{node}' cannot broadcast {lhs:?} with {rhs:?}")]
    Broadcast {
        node: String,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    #[error("could not infer shape for {op} node '{node}': {reason}")]
    CannotInfer {
        op: OpKind,
        node: String,
        reason: String,
    },
}

/// Run static shape inference, replacing `graph.value_shapes`.
pub fn infer_shapes(graph: &mut Graph) -> Result<(), ShapeInferenceError> {
    let mut shapes: HashMap<String, Vec<usize>> = HashMap::new();
    for input in &graph.inputs {
        shapes.insert(input.name.clone(), input.shape.clone());
    }
    for (name, tensor) in &graph.initializers {
        shapes.insert(name.clone(), tensor.shape().to_vec());
    }

    for node in &graph.nodes {
        let out = match &node.op {
            Op::Relu => lookup(&shapes, &node.inputs[0])?.to_vec(),
            Op::Add | Op::Mul => {
                let lhs = lookup(&shapes, &node.inputs[0])?;
                let rhs = lookup(&shapes, &node.inputs[1])?;
                broadcast_shapes(lhs, rhs).ok_or_else(|| ShapeInferenceError::Broadcast {
                    node: node.name.clone(),
                    lhs: lhs.to_vec(),
                    rhs: rhs.to_vec(),
                })?
            }
            Op::Conv(attrs) => conv_output_shape(
                lookup(&shapes, &node.inputs[0])?,
                lookup(&shapes, &node.inputs[1])?,
                attrs,
            )
            .map_err(|reason| ShapeInferenceError::CannotInfer {
                op: OpKind::Conv,
                node: node.name.clone(),
                reason,
            })?,
        };

        for output in &node.outputs {
            shapes.insert(output.clone(), out.clone());
        }
    }

    graph.value_shapes = shapes;
    Ok(())
}

fn lookup<'a>(
    shapes: &'a HashMap<String, Vec<usize>>,
    name: &str,
) -> Result<&'a [usize], ShapeInferenceError> {
    shapes
        .get(name)
        .map(|s| s.as_slice())
        .ok_or_else(|| ShapeInferenceError::MissingShape(name.to_string()))
}

/// Numpy-style broadcast of two shapes.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let mut result = Vec::new();
    let mut ai = a.iter().rev();
    let mut bi = b.iter().rev();

    loop {
        match (ai.next(), bi.next()) {
            (Some(&ad), Some(&bd)) => {
                if ad == bd || bd == 1 {
                    result.push(ad);
                } else if ad == 1 {
                    result.push(bd);
                } else {
                    return None;
                }
            }
            (Some(&ad), None) => result.push(ad),
            (None, Some(&bd)) => result.push(bd),
            (None, None) => break,
        }
    }

    result.reverse();
    Some(result)
}

/// Output shape of an NCHW convolution with `[M, C/group, kH, kW]` weights.
pub fn conv_output_shape(
    input: &[usize],
    weights: &[usize],
    attrs: &ConvAttrs,
) -> Result<Vec<usize>, String> {
    if input.len() != 4 {
        return Err(format!("expected NCHW input, got shape {:?}", input));
    }
    if weights.len() != 4 {
        return Err(format!("expected rank-4 weights, got shape {:?}", weights));
    }
    if weights[1] * attrs.group != input[1] {
        return Err(format!(
            "input has {} channels but weights expect {} x group {}",
            input[1], weights[1], attrs.group
        ));
    }

    let mut out = vec![input[0], weights[0]];
    for axis in 0..2 {
        if attrs.kernel_shape[axis] == 0 {
            return Err(format!("empty kernel on spatial axis {}", axis));
        }
        if attrs.strides[axis] == 0 || attrs.dilations[axis] == 0 {
            return Err(format!("zero stride or dilation on spatial axis {}", axis));
        }
        let padded = input[2 + axis] + attrs.pads[axis] + attrs.pads[2 + axis];
        let span = attrs.dilations[axis] * (attrs.kernel_shape[axis] - 1) + 1;
        if padded < span {
            return Err(format!(
                "kernel span {} exceeds padded extent {} on spatial axis {}",
                span, padded, axis
            ));
        }
        out.push((padded - span) / attrs.strides[axis] + 1);
    }
    Ok(out)
}
