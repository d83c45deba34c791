use crate::ir::{Graph, Op, OpKind, Tensor};
use crate::transform::{match_op_before_conv, move_past_conv, TransformError, Transformation};
use log::{debug, info};
use ndarray::{s, ArrayD, Ix4, IxDyn};

/// Move an Add of a scalar or per-channel constant past the Conv consuming
/// it, so that adds collect next to each other.
///
/// Without padding every output pixel sees a full kernel window, so
/// `conv(x + a, W) == conv(x, W) + a'` with
/// `a'[co] = sum over (ci, kh, kw) of W[co, ci, kh, kw] * a[ci]`.
/// Zero padding lets border windows see fewer copies of `a`, so padded
/// convolutions are left alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct MoveAddPastConv;

impl Transformation for MoveAddPastConv {
    fn name(&self) -> &'static str {
        "move_add_past_conv"
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool, TransformError> {
        for idx in 0..graph.nodes.len() {
            let Some(pair) = match_op_before_conv(graph, idx, OpKind::Add) else {
                continue;
            };

            let conv = &graph.nodes[pair.conv_idx];
            let Op::Conv(attrs) = &conv.op else {
                continue;
            };
            if attrs.has_padding() {
                debug!(
                    "{}: consumer '{}' is padded {:?}",
                    graph.nodes[idx].name, conv.name, attrs.pads
                );
                continue;
            }

            let (Some(addend), Some(weights)) = (
                graph.initializer(&pair.constant),
                graph.initializer(&conv.inputs[1]),
            ) else {
                continue;
            };
            let Some(folded) = fold_through_kernel(addend, weights, attrs.group) else {
                debug!(
                    "{}: addend shape {:?} is neither scalar nor per-channel",
                    graph.nodes[idx].name,
                    addend.shape()
                );
                continue;
            };

            // The addend may be shared with other nodes; only overwrite it in
            // place when this Add is its sole reader.
            let name = if graph.consumer_indices(&pair.constant).len() == 1 {
                pair.constant.clone()
            } else {
                graph.unique_name(&pair.constant)
            };

            info!(
                "moving {} past {}",
                graph.nodes[idx].name, graph.nodes[pair.conv_idx].name
            );
            graph.initializers.insert(name.clone(), folded);
            graph.nodes[idx].inputs[1 - pair.data_slot] = name;
            move_past_conv(graph, &pair);
            return Ok(true);
        }
        Ok(false)
    }
}

/// Push an additive constant through a convolution kernel. `addend` must be
/// a single value or shaped `[1, C_in, 1, 1]`; the result is
/// `[1, C_out, 1, 1]`.
pub fn fold_through_kernel(addend: &Tensor, weights: &Tensor, group: usize) -> Option<Tensor> {
    let w = weights.view().into_dimensionality::<Ix4>().ok()?;
    let (c_out, c_per_group, _, _) = w.dim();
    let c_in = c_per_group * group;
    if group == 0 || c_out % group != 0 {
        return None;
    }

    let per_channel: Vec<f32> = if addend.len() == 1 {
        vec![addend.iter().copied().next()?; c_in]
    } else if addend.shape() == [1, c_in, 1, 1] {
        addend.iter().copied().collect()
    } else {
        return None;
    };

    let out_per_group = c_out / group;
    let folded: Vec<f32> = (0..c_out)
        .map(|co| {
            let first_in = (co / out_per_group) * c_per_group;
            (0..c_per_group)
                .map(|ci| per_channel[first_in + ci] * w.slice(s![co, ci, .., ..]).sum())
                .sum()
        })
        .collect();

    ArrayD::from_shape_vec(IxDyn(&[1, c_out, 1, 1]), folded).ok()
}
