use crate::ast::{new_graph_json, DataType, GraphJson, Node, OperandDesc, TensorJson};
use log::{debug, warn};
use onnx::onnx::{AttributeProto, ModelProto, NodeProto, TensorProto, TensorProto_DataType};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OnnxError {
    #[error("failed to read '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to decode ONNX model: {0}")]
    Decode(#[from] protobuf::ProtobufError),
    #[error("model has no graph")]
    MissingGraph,
    #[error("input '{0}' has no static tensor shape")]
    MissingInputShape(String),
    #[error("input '{input}' has dynamic dimension '{dim}'")]
    DynamicDim { input: String, dim: String },
    #[error("unsupported ONNX data type {data_type} on '{name}'")]
    UnsupportedDataType { name: String, data_type: i32 },
    #[error("initializer '{name}' is invalid: {reason}")]
    InvalidTensor { name: String, reason: String },
}

pub fn load_onnx_model(path: &Path) -> Result<ModelProto, OnnxError> {
    let bytes = fs::read(path).map_err(|source| OnnxError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(protobuf::parse_from_bytes::<ModelProto>(&bytes)?)
}

/// Translate the model's main graph into the JSON wire form. Ops and
/// attributes are copied through untouched; `ir::convert` decides what is
/// supported.
pub fn import_model(model: &ModelProto) -> Result<GraphJson, OnnxError> {
    if !model.has_graph() {
        return Err(OnnxError::MissingGraph);
    }
    let graph = model.get_graph();
    let mut json = new_graph_json();
    if !graph.get_name().is_empty() {
        json.name = Some(graph.get_name().to_string());
    }

    let initializer_names: HashSet<&str> =
        graph.get_initializer().iter().map(|t| t.get_name()).collect();

    for input in graph.get_input() {
        let name = input.get_name();
        // Older exporters list initializers as graph inputs too.
        if initializer_names.contains(name) {
            continue;
        }
        if !input.has_field_type() || !input.get_field_type().has_tensor_type() {
            return Err(OnnxError::MissingInputShape(name.to_string()));
        }
        let tensor_type = input.get_field_type().get_tensor_type();
        if !tensor_type.has_shape() {
            return Err(OnnxError::MissingInputShape(name.to_string()));
        }
        let mut shape = Vec::new();
        for dim in tensor_type.get_shape().get_dim() {
            if dim.has_dim_value() && dim.get_dim_value() >= 0 {
                shape.push(dim.get_dim_value() as u32);
            } else {
                return Err(OnnxError::DynamicDim {
                    input: name.to_string(),
                    dim: dim.get_dim_param().to_string(),
                });
            }
        }
        json.inputs.push(OperandDesc {
            name: name.to_string(),
            data_type: map_data_type(name, tensor_type.get_elem_type())?,
            shape,
        });
    }

    for output in graph.get_output() {
        json.outputs.push(output.get_name().to_string());
    }

    for init in graph.get_initializer() {
        json.initializers
            .insert(init.get_name().to_string(), read_float_tensor(init)?);
    }

    for node in graph.get_node() {
        json.nodes.push(import_node(node));
    }

    debug!(
        "imported ONNX graph: {} inputs, {} initializers, {} nodes",
        json.inputs.len(),
        json.initializers.len(),
        json.nodes.len()
    );
    Ok(json)
}

fn map_data_type(name: &str, elem_type: TensorProto_DataType) -> Result<DataType, OnnxError> {
    match elem_type {
        TensorProto_DataType::FLOAT => Ok(DataType::Float32),
        TensorProto_DataType::FLOAT16 => Ok(DataType::Float16),
        TensorProto_DataType::INT32 => Ok(DataType::Int32),
        TensorProto_DataType::UINT32 => Ok(DataType::Uint32),
        TensorProto_DataType::INT64 => Ok(DataType::Int64),
        TensorProto_DataType::UINT64 => Ok(DataType::Uint64),
        TensorProto_DataType::INT8 => Ok(DataType::Int8),
        TensorProto_DataType::UINT8 => Ok(DataType::Uint8),
        other => Err(OnnxError::UnsupportedDataType {
            name: name.to_string(),
            data_type: other as i32,
        }),
    }
}

fn read_float_tensor(tensor: &TensorProto) -> Result<TensorJson, OnnxError> {
    let name = tensor.get_name();
    if tensor.get_data_type() != TensorProto_DataType::FLOAT {
        return Err(OnnxError::UnsupportedDataType {
            name: name.to_string(),
            data_type: tensor.get_data_type() as i32,
        });
    }
    let invalid = |reason: String| OnnxError::InvalidTensor {
        name: name.to_string(),
        reason,
    };

    let shape = tensor
        .get_dims()
        .iter()
        .map(|&d| u32::try_from(d).map_err(|_| invalid(format!("bad dimension {}", d))))
        .collect::<Result<Vec<u32>, _>>()?;

    let raw = tensor.get_raw_data();
    let data: Vec<f32> = if !raw.is_empty() {
        if raw.len() % 4 != 0 {
            return Err(invalid(format!("raw data length {} is not a multiple of 4", raw.len())));
        }
        raw.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    } else {
        tensor.get_float_data().to_vec()
    };

    let expected: usize = shape.iter().map(|&d| d as usize).product();
    if data.len() != expected {
        return Err(invalid(format!(
            "{} values for shape {:?}",
            data.len(),
            shape
        )));
    }
    Ok(TensorJson { shape, data })
}

fn import_node(node: &NodeProto) -> Node {
    let mut options = Map::new();
    for attr in node.get_attribute() {
        match attribute_value(attr) {
            Some(v) => {
                options.insert(attr.get_name().to_string(), v);
            }
            None => warn!(
                "{}: dropping attribute '{}' of unsupported type",
                node.get_name(),
                attr.get_name()
            ),
        }
    }
    Node {
        name: Some(node.get_name().to_string()).filter(|n| !n.is_empty()),
        op: node.get_op_type().to_string(),
        inputs: node.get_input().to_vec(),
        outputs: node.get_output().to_vec(),
        options,
    }
}

fn attribute_value(attr: &AttributeProto) -> Option<Value> {
    if !attr.get_ints().is_empty() {
        Some(Value::from(attr.get_ints().to_vec()))
    } else if !attr.get_floats().is_empty() {
        Some(Value::from(attr.get_floats().to_vec()))
    } else if attr.has_i() {
        Some(Value::from(attr.get_i()))
    } else if attr.has_f() {
        Some(Value::from(attr.get_f()))
    } else if attr.has_s() {
        Some(Value::from(String::from_utf8_lossy(attr.get_s()).into_owned()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::convert::graph_from_json;
    use crate::ir::OpKind;
    use onnx::onnx::{
        GraphProto, TensorShapeProto, TensorShapeProto_Dimension, TypeProto, TypeProto_Tensor,
        ValueInfoProto,
    };

    fn value_info(name: &str, dims: &[Option<i64>]) -> ValueInfoProto {
        let mut shape = TensorShapeProto::new();
        for d in dims {
            let mut dim = TensorShapeProto_Dimension::new();
            match d {
                Some(v) => dim.set_dim_value(*v),
                None => dim.set_dim_param("batch".to_string()),
            }
            shape.mut_dim().push(dim);
        }
        let mut tensor_type = TypeProto_Tensor::new();
        tensor_type.set_elem_type(TensorProto_DataType::FLOAT);
        tensor_type.set_shape(shape);
        let mut type_proto = TypeProto::new();
        type_proto.set_tensor_type(tensor_type);
        let mut vi = ValueInfoProto::new();
        vi.set_name(name.to_string());
        vi.set_field_type(type_proto);
        vi
    }

    fn float_tensor(name: &str, dims: &[i64], data: &[f32]) -> TensorProto {
        let mut t = TensorProto::new();
        t.set_name(name.to_string());
        t.set_data_type(TensorProto_DataType::FLOAT);
        t.set_dims(dims.to_vec());
        t.set_raw_data(data.iter().flat_map(|v| v.to_le_bytes()).collect());
        t
    }

    fn node(op: &str, inputs: &[&str], outputs: &[&str]) -> NodeProto {
        let mut n = NodeProto::new();
        n.set_op_type(op.to_string());
        n.set_input(protobuf::RepeatedField::from_vec(
            inputs.iter().map(|s| s.to_string()).collect(),
        ));
        n.set_output(protobuf::RepeatedField::from_vec(
            outputs.iter().map(|s| s.to_string()).collect(),
        ));
        n
    }

    fn mul_conv_model() -> ModelProto {
        let mut conv = node("Conv", &["t", "w"], &["y"]);
        let mut kernel = AttributeProto::new();
        kernel.set_name("kernel_shape".to_string());
        kernel.set_ints(vec![3, 3]);
        conv.mut_attribute().push(kernel);

        let mut graph = GraphProto::new();
        graph.set_name("mul_conv".to_string());
        graph.mut_input().push(value_info("x", &[Some(1), Some(1), Some(5), Some(5)]));
        // Listed as an input as well, the way older exporters do.
        graph.mut_input().push(value_info("s", &[Some(1)]));
        graph.mut_output().push(value_info("y", &[]));
        graph.mut_initializer().push(float_tensor("s", &[1], &[2.0]));
        graph
            .mut_initializer()
            .push(float_tensor("w", &[1, 1, 3, 3], &[0.5; 9]));
        graph.mut_node().push(node("Mul", &["x", "s"], &["t"]));
        graph.mut_node().push(conv);

        let mut model = ModelProto::new();
        model.set_graph(graph);
        model
    }

    #[test]
    fn imports_mul_conv_model() {
        let json = import_model(&mul_conv_model()).unwrap();
        assert_eq!(json.name.as_deref(), Some("mul_conv"));
        assert_eq!(json.inputs.len(), 1);
        assert_eq!(json.inputs[0].shape, vec![1, 1, 5, 5]);
        assert_eq!(json.initializers["w"].data, vec![0.5; 9]);
        assert_eq!(json.nodes[1].options["kernel_shape"], serde_json::json!([3, 3]));

        let g = graph_from_json(&json).unwrap();
        assert_eq!(g.op_kinds(), vec![OpKind::Mul, OpKind::Conv]);
        assert_eq!(g.tensor_shape("y"), Some(&[1usize, 1, 3, 3][..]));
    }

    #[test]
    fn dynamic_dim_is_rejected() {
        let mut model = mul_conv_model();
        model.mut_graph().mut_input()[0] = value_info("x", &[None, Some(1), Some(5), Some(5)]);
        let res = import_model(&model);
        assert!(matches!(
            res,
            Err(OnnxError::DynamicDim { input, dim }) if input == "x" && dim == "batch"
        ));
    }

    #[test]
    fn truncated_raw_data_is_rejected() {
        let mut model = mul_conv_model();
        model.mut_graph().mut_initializer()[1].set_raw_data(vec![0u8; 6]);
        assert!(matches!(
            import_model(&model),
            Err(OnnxError::InvalidTensor { .. })
        ));
    }
}
