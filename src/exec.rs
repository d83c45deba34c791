// Reference forward executor. Straightforward loops, no fusion: its job is to
// be obviously correct so the equivalence oracle can trust it.
use crate::ir::{ConvAttrs, Graph, Node, Op, Tensor};
use crate::shape_inference::{broadcast_shapes, conv_output_shape};
use ndarray::{Array4, Ix4};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("missing value for graph input '{0}'")]
    MissingInput(String),
    #[error("graph input '{name}' expects shape {expected:?}, got {got:?}")]
    InputShape {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("node '{node}' reads '{value}' which has not been computed")]
    MissingValue { node: String, value: String },
    #[error("node '{node}' cannot broadcast {lhs:?} with {rhs:?}")]
    Broadcast {
        node: String,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    #[error("convolution '{node}' failed: {reason}")]
    Conv { node: String, reason: String },
    #[error("graph output '{0}' was not computed")]
    MissingOutput(String),
}

/// Value name to tensor, covering inputs, initializers and intermediates.
pub type ExecContext = HashMap<String, Tensor>;

/// Execute the graph once and return its declared outputs.
pub fn execute_graph(
    graph: &Graph,
    inputs: &HashMap<String, Tensor>,
) -> Result<HashMap<String, Tensor>, ExecError> {
    let mut ctx: ExecContext = graph.initializers.clone();

    for decl in &graph.inputs {
        let value = inputs
            .get(&decl.name)
            .ok_or_else(|| ExecError::MissingInput(decl.name.clone()))?;
        if value.shape() != decl.shape.as_slice() {
            return Err(ExecError::InputShape {
                name: decl.name.clone(),
                expected: decl.shape.clone(),
                got: value.shape().to_vec(),
            });
        }
        ctx.insert(decl.name.clone(), value.clone());
    }

    for node in &graph.nodes {
        execute_node(node, &mut ctx)?;
    }

    graph
        .outputs
        .iter()
        .map(|name| {
            ctx.remove(name)
                .map(|t| (name.clone(), t))
                .ok_or_else(|| ExecError::MissingOutput(name.clone()))
        })
        .collect()
}

/// Execute a single node, writing its output into `ctx`.
pub fn execute_node(node: &Node, ctx: &mut ExecContext) -> Result<(), ExecError> {
    let values: &ExecContext = ctx;
    let value = |i: usize| read_input(values, node, i);

    let result = match &node.op {
        Op::Relu => value(0)?.mapv(|v| v.max(0.0)),
        Op::Add | Op::Mul => {
            let lhs = value(0)?;
            let rhs = value(1)?;
            if broadcast_shapes(lhs.shape(), rhs.shape()).is_none() {
                return Err(ExecError::Broadcast {
                    node: node.name.clone(),
                    lhs: lhs.shape().to_vec(),
                    rhs: rhs.shape().to_vec(),
                });
            }
            if matches!(node.op, Op::Add) {
                lhs + rhs
            } else {
                lhs * rhs
            }
        }
        Op::Conv(attrs) => {
            let bias = match node.inputs.get(2) {
                Some(_) => Some(value(2)?),
                None => None,
            };
            conv2d(value(0)?, value(1)?, bias, attrs).map_err(|reason| ExecError::Conv {
                node: node.name.clone(),
                reason,
            })?
        }
    };

    ctx.insert(node.outputs[0].clone(), result);
    Ok(())
}

fn read_input<'a>(ctx: &'a ExecContext, node: &Node, i: usize) -> Result<&'a Tensor, ExecError> {
    ctx.get(&node.inputs[i]).ok_or_else(|| ExecError::MissingValue {
        node: node.name.clone(),
        value: node.inputs[i].clone(),
    })
}

/// Direct NCHW convolution with zero padding.
pub fn conv2d(
    input: &Tensor,
    weights: &Tensor,
    bias: Option<&Tensor>,
    attrs: &ConvAttrs,
) -> Result<Tensor, String> {
    let x = input
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| format!("input: {}", e))?;
    let w = weights
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| format!("weights: {}", e))?;

    let out_shape = conv_output_shape(x.shape(), w.shape(), attrs)?;
    let (batch, _, height, width) = x.dim();
    let (c_out, c_per_group, kh, kw) = w.dim();
    let out_per_group = c_out / attrs.group;
    let (oh, ow) = (out_shape[2], out_shape[3]);

    let bias: Vec<f32> = match bias {
        Some(b) if b.len() == c_out => b.iter().copied().collect(),
        Some(b) => return Err(format!("bias has {} elements, expected {}", b.len(), c_out)),
        None => vec![0.0; c_out],
    };

    let [pad_top, pad_left, _, _] = attrs.pads;
    let [stride_y, stride_x] = attrs.strides;
    let [dil_y, dil_x] = attrs.dilations;

    let mut out = Array4::<f32>::zeros((batch, c_out, oh, ow));
    for n in 0..batch {
        for co in 0..c_out {
            let first_in = (co / out_per_group) * c_per_group;
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = 0.0f32;
                    for ci in 0..c_per_group {
                        for ky in 0..kh {
                            let iy = (oy * stride_y + ky * dil_y) as isize - pad_top as isize;
                            if iy < 0 || iy >= height as isize {
                                continue;
                            }
                            for kx in 0..kw {
                                let ix =
                                    (ox * stride_x + kx * dil_x) as isize - pad_left as isize;
                                if ix < 0 || ix >= width as isize {
                                    continue;
                                }
                                acc += x[[n, first_in + ci, iy as usize, ix as usize]]
                                    * w[[co, ci, ky, kx]];
                            }
                        }
                    }
                    out[[n, co, oy, ox]] = acc + bias[co];
                }
            }
        }
    }
    Ok(out.into_dyn())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, OpKind};
    use ndarray::{ArrayD, IxDyn};

    fn tensor(shape: &[usize], data: Vec<f32>) -> Tensor {
        ArrayD::from_shape_vec(IxDyn(shape), data).unwrap()
    }

    #[test]
    fn conv_valid_matches_hand_computation() {
        // 3x3 input 1..9, 2x2 kernel of ones: each output is a window sum.
        let x = tensor(&[1, 1, 3, 3], (1..=9).map(|v| v as f32).collect());
        let w = tensor(&[1, 1, 2, 2], vec![1.0; 4]);
        let y = conv2d(&x, &w, None, &ConvAttrs::new([2, 2])).unwrap();
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        assert_eq!(y.iter().copied().collect::<Vec<_>>(), vec![12.0, 16.0, 24.0, 28.0]);
    }

    #[test]
    fn conv_zero_padding_and_bias() {
        let x = tensor(&[1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let w = tensor(&[1, 1, 3, 3], vec![1.0; 9]);
        let b = tensor(&[1], vec![0.5]);
        let attrs = ConvAttrs::new([3, 3]).with_pads([1, 1, 1, 1]);
        let y = conv2d(&x, &w, Some(&b), &attrs).unwrap();
        // Every 3x3 window around a 2x2 input covers all four values.
        assert_eq!(y.iter().copied().collect::<Vec<_>>(), vec![10.5; 4]);
    }

    #[test]
    fn grouped_conv_keeps_channels_apart() {
        let x = tensor(&[1, 2, 1, 1], vec![3.0, 5.0]);
        let w = tensor(&[2, 1, 1, 1], vec![2.0, 10.0]);
        let attrs = ConvAttrs::new([1, 1]).with_group(2);
        let y = conv2d(&x, &w, None, &attrs).unwrap();
        assert_eq!(y.iter().copied().collect::<Vec<_>>(), vec![6.0, 50.0]);
    }

    #[test]
    fn strided_dilated_conv() {
        let x = tensor(&[1, 1, 5, 5], (0..25).map(|v| v as f32).collect());
        let w = tensor(&[1, 1, 2, 2], vec![1.0, 0.0, 0.0, 1.0]);
        let attrs = ConvAttrs::new([2, 2])
            .with_strides([2, 2])
            .with_dilations([2, 2]);
        let y = conv2d(&x, &w, None, &attrs).unwrap();
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        // x[oy*2][ox*2] + x[oy*2+2][ox*2+2]
        assert_eq!(y.iter().copied().collect::<Vec<_>>(), vec![12.0, 16.0, 32.0, 36.0]);
    }

    #[test]
    fn execute_graph_broadcasts_and_relus() {
        let g = GraphBuilder::new("g")
            .input("x", &[1, 2, 1, 2])
            .output("y")
            .initializer("s", tensor(&[1], vec![-2.0]))
            .node(crate::ir::Op::Mul, &["x", "s"], &["m"])
            .node(crate::ir::Op::Relu, &["m"], &["y"])
            .build()
            .unwrap();
        assert_eq!(g.op_kinds(), vec![OpKind::Mul, OpKind::Relu]);

        let mut inputs = HashMap::new();
        inputs.insert(
            "x".to_string(),
            tensor(&[1, 2, 1, 2], vec![1.0, -1.0, 0.5, -3.0]),
        );
        let out = execute_graph(&g, &inputs).unwrap();
        assert_eq!(
            out["y"].iter().copied().collect::<Vec<_>>(),
            vec![0.0, 2.0, 0.0, 6.0]
        );
    }

    #[test]
    fn execute_graph_checks_input_shape() {
        let g = GraphBuilder::new("g")
            .input("x", &[1, 1, 2, 2])
            .output("y")
            .node(crate::ir::Op::Relu, &["x"], &["y"])
            .build()
            .unwrap();
        let mut inputs = HashMap::new();
        inputs.insert("x".to_string(), tensor(&[1, 1, 1, 4], vec![0.0; 4]));
        assert!(matches!(
            execute_graph(&g, &inputs),
            Err(ExecError::InputShape { .. })
        ));
        assert!(matches!(
            execute_graph(&g, &HashMap::new()),
            Err(ExecError::MissingInput(name)) if name == "x"
        ));
    }
}
