use crate::ir::{Graph, OpKind};
use crate::transform::{match_op_before_conv, move_past_conv, TransformError, Transformation};
use log::{debug, info};

/// Move a Mul by a single-element constant past the Conv consuming it.
///
/// Convolution is linear in its input, so `conv(s * x, W) == s * conv(x, W)`
/// for any padding, stride, dilation or group. A Conv bias breaks the
/// identity and blocks the move.
#[derive(Debug, Default, Clone, Copy)]
pub struct MoveScalarMulPastConv;

impl Transformation for MoveScalarMulPastConv {
    fn name(&self) -> &'static str {
        "move_scalar_mul_past_conv"
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool, TransformError> {
        for idx in 0..graph.nodes.len() {
            let Some(pair) = match_op_before_conv(graph, idx, OpKind::Mul) else {
                continue;
            };

            let scalar_len = graph.initializer(&pair.constant).map(|t| t.len());
            if scalar_len != Some(1) {
                debug!(
                    "{}: multiplier '{}' is not a scalar",
                    graph.nodes[idx].name, pair.constant
                );
                continue;
            }
            if graph.nodes[pair.conv_idx].inputs.len() > 2 {
                debug!(
                    "{}: consumer '{}' has a bias",
                    graph.nodes[idx].name, graph.nodes[pair.conv_idx].name
                );
                continue;
            }

            info!(
                "moving {} past {}",
                graph.nodes[idx].name, graph.nodes[pair.conv_idx].name
            );
            move_past_conv(graph, &pair);
            return Ok(true);
        }
        Ok(false)
    }
}
