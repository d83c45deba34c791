// Conversion between the untyped wire form and the typed graph.
use crate::ast::{self, DataType, GraphJson, OperandDesc, TensorJson};
use crate::ir::{ConvAttrs, Graph, GraphError, Node, Op, OpKind, ValueDecl};
use ndarray::{ArrayD, IxDyn};
use serde_json::{Map, Value};

/// Build a checked typed graph from its wire form.
pub fn graph_from_json(json: &GraphJson) -> Result<Graph, GraphError> {
    let mut graph = Graph::new(json.name.clone().unwrap_or_else(|| "graph".to_string()));

    for input in &json.inputs {
        if input.data_type != DataType::Float32 {
            return Err(GraphError::UnsupportedDataType {
                name: input.name.clone(),
                data_type: input.data_type,
            });
        }
        graph.inputs.push(ValueDecl {
            name: input.name.clone(),
            shape: input.shape.iter().map(|&d| d as usize).collect(),
        });
    }
    graph.outputs = json.outputs.clone();

    for (name, tensor) in &json.initializers {
        let shape: Vec<usize> = tensor.shape.iter().map(|&d| d as usize).collect();
        let array = ArrayD::from_shape_vec(IxDyn(&shape), tensor.data.clone()).map_err(|e| {
            GraphError::InvalidInitializer {
                name: name.clone(),
                reason: e.to_string(),
            }
        })?;
        graph.initializers.insert(name.clone(), array);
    }

    for (idx, node) in json.nodes.iter().enumerate() {
        graph.nodes.push(convert_node(idx, node, &graph)?);
    }

    graph.into_checked()
}

/// Wire form of a typed graph, used when writing rewritten graphs out.
pub fn graph_to_json(graph: &Graph) -> GraphJson {
    let mut json = ast::new_graph_json();
    json.name = Some(graph.name.clone());
    json.inputs = graph
        .inputs
        .iter()
        .map(|i| OperandDesc {
            name: i.name.clone(),
            data_type: DataType::Float32,
            shape: i.shape.iter().map(|&d| d as u32).collect(),
        })
        .collect();
    json.outputs = graph.outputs.clone();
    for (name, tensor) in &graph.initializers {
        json.initializers.insert(
            name.clone(),
            TensorJson {
                shape: tensor.shape().iter().map(|&d| d as u32).collect(),
                data: tensor.iter().copied().collect(),
            },
        );
    }
    json.nodes = graph
        .nodes
        .iter()
        .map(|node| ast::Node {
            name: Some(node.name.clone()),
            op: node.op.kind().to_string(),
            inputs: node.inputs.clone(),
            outputs: node.outputs.clone(),
            options: node_options(&node.op),
        })
        .collect();
    json
}

fn node_options(op: &Op) -> Map<String, Value> {
    let mut options = Map::new();
    if let Op::Conv(attrs) = op {
        options.insert(
            "kernel_shape".to_string(),
            serde_json::json!(attrs.kernel_shape),
        );
        options.insert("pads".to_string(), serde_json::json!(attrs.pads));
        options.insert("strides".to_string(), serde_json::json!(attrs.strides));
        options.insert("dilations".to_string(), serde_json::json!(attrs.dilations));
        options.insert("group".to_string(), serde_json::json!(attrs.group));
    }
    options
}

fn convert_node(idx: usize, node: &ast::Node, graph: &Graph) -> Result<Node, GraphError> {
    let node_name = node
        .name
        .clone()
        .unwrap_or_else(|| format!("{}_{}", node.op, idx));

    let kind = OpKind::parse(&node.op).ok_or_else(|| GraphError::UnsupportedOp {
        op: node.op.clone(),
        node: node_name.clone(),
    })?;

    let op = match kind {
        OpKind::Add => Op::Add,
        OpKind::Mul => Op::Mul,
        OpKind::Relu => Op::Relu,
        OpKind::Conv => Op::Conv(convert_conv_attrs(node, &node_name, graph)?),
    };

    Ok(Node {
        name: node_name,
        op,
        inputs: node.inputs.clone(),
        outputs: node.outputs.clone(),
    })
}

fn convert_conv_attrs(
    node: &ast::Node,
    node_name: &str,
    graph: &Graph,
) -> Result<ConvAttrs, GraphError> {
    let options = &node.options;

    let kernel_shape = match read_ints(options, "kernel_shape", node_name)? {
        Some(k) => fixed::<2>(&k, "kernel_shape", node_name)?,
        None => {
            // Fall back to the spatial dims of the weight initializer.
            let weights = node
                .inputs
                .get(1)
                .and_then(|w| graph.initializer(w))
                .ok_or_else(|| GraphError::MissingAttribute {
                    attr: "kernel_shape".to_string(),
                    node: node_name.to_string(),
                })?;
            let shape = weights.shape();
            if shape.len() != 4 {
                return Err(GraphError::UnsupportedAttribute {
                    attr: "kernel_shape".to_string(),
                    node: node_name.to_string(),
                    value: format!("{:?}", &shape[2.min(shape.len())..]),
                });
            }
            [shape[2], shape[3]]
        }
    };

    match options.get("auto_pad").and_then(|v| v.as_str()) {
        None | Some("NOTSET") | Some("VALID") => {}
        Some(other) => {
            return Err(GraphError::UnsupportedAttribute {
                attr: "auto_pad".to_string(),
                node: node_name.to_string(),
                value: other.to_string(),
            })
        }
    }

    let mut attrs = ConvAttrs::new(kernel_shape);
    if let Some(p) = read_ints(options, "pads", node_name)? {
        attrs.pads = fixed::<4>(&p, "pads", node_name)?;
    }
    if let Some(s) = read_ints(options, "strides", node_name)? {
        attrs.strides = fixed::<2>(&s, "strides", node_name)?;
    }
    if let Some(d) = read_ints(options, "dilations", node_name)? {
        attrs.dilations = fixed::<2>(&d, "dilations", node_name)?;
    }
    if let Some(g) = options.get("group") {
        attrs.group = g
            .as_u64()
            .filter(|&g| g > 0)
            .ok_or_else(|| GraphError::InvalidAttribute {
                attr: "group".to_string(),
                node: node_name.to_string(),
                reason: format!("expected a positive integer, got {}", g),
            })? as usize;
    }
    if attrs.strides.contains(&0) || attrs.dilations.contains(&0) {
        return Err(GraphError::InvalidAttribute {
            attr: "strides/dilations".to_string(),
            node: node_name.to_string(),
            reason: "must be positive".to_string(),
        });
    }
    Ok(attrs)
}

fn read_ints(
    options: &Map<String, Value>,
    key: &str,
    node_name: &str,
) -> Result<Option<Vec<i64>>, GraphError> {
    let Some(value) = options.get(key) else {
        return Ok(None);
    };
    let invalid = || GraphError::InvalidAttribute {
        attr: key.to_string(),
        node: node_name.to_string(),
        reason: format!("expected an integer list, got {}", value),
    };
    value
        .as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|v| v.as_i64().ok_or_else(invalid))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn fixed<const N: usize>(
    values: &[i64],
    key: &str,
    node_name: &str,
) -> Result<[usize; N], GraphError> {
    if values.len() != N {
        return Err(GraphError::UnsupportedAttribute {
            attr: key.to_string(),
            node: node_name.to_string(),
            value: format!("{:?} (only 2D convolution is supported)", values),
        });
    }
    let mut out = [0usize; N];
    for (slot, &v) in out.iter_mut().zip(values) {
        if v < 0 {
            return Err(GraphError::InvalidAttribute {
                attr: key.to_string(),
                node: node_name.to_string(),
                reason: format!("negative value {}", v),
            });
        }
        *slot = v as usize;
    }
    Ok(out)
}
