// Folding-configuration patcher: rewrites per-layer hardware resource
// attributes in a JSON folding config, selected by layer category and the
// layer's numeric index.
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FoldingError {
    #[error("failed to read '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write '{}': {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid JSON in '{}': {source}", .path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("folding config must be a JSON object keyed by layer name")]
    NotAnObject,
    #[error("layer '{0}' has no numeric index suffix")]
    InvalidLayerIndex(String),
    #[error("entry for layer '{0}' is not a JSON object")]
    InvalidLayerEntry(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerCategory {
    MatrixVector,
    VectorVector,
}

impl LayerCategory {
    /// Classify by the op-type token that starts the layer name.
    pub fn from_op_type(op_type: &str) -> Option<Self> {
        match op_type {
            "MatrixVectorActivation" | "MVAU" => Some(LayerCategory::MatrixVector),
            "VectorVectorActivation" | "VVAU" => Some(LayerCategory::VectorVector),
            _ => None,
        }
    }
}

/// A layer name such as `MatrixVectorActivation_12` or `MVAU_hls_3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerId {
    pub category: LayerCategory,
    pub index: u32,
}

impl LayerId {
    /// `Ok(None)` for names outside the known categories (e.g. `Defaults`).
    pub fn parse(name: &str) -> Result<Option<Self>, FoldingError> {
        let mut tokens = name.split('_');
        let Some(category) = tokens.next().and_then(LayerCategory::from_op_type) else {
            return Ok(None);
        };
        let index = name
            .rsplit('_')
            .next()
            .filter(|_| name.contains('_'))
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| FoldingError::InvalidLayerIndex(name.to_string()))?;
        Ok(Some(LayerId { category, index }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RamStyle {
    Auto,
    Block,
    Distributed,
    Ultra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResType {
    Auto,
    Lut,
    Dsp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemMode {
    Const,
    Decoupled,
    External,
}

/// Set `value` on every layer whose index is at least `from_idx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threshold<T> {
    pub from_idx: u32,
    pub value: T,
}

impl<T> Threshold<T> {
    pub fn new(from_idx: u32, value: T) -> Self {
        Self { from_idx, value }
    }

    fn applies_to(&self, index: u32) -> bool {
        index >= self.from_idx
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRules {
    pub ram_style: Threshold<RamStyle>,
    pub res_type: Threshold<ResType>,
    pub mem_mode: Threshold<MemMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FoldingRules {
    pub matrix_vector: CategoryRules,
    pub vector_vector: CategoryRules,
}

impl Default for FoldingRules {
    fn default() -> Self {
        Self {
            matrix_vector: CategoryRules {
                ram_style: Threshold::new(33, RamStyle::Auto),
                res_type: Threshold::new(0, ResType::Dsp),
                mem_mode: Threshold::new(33, MemMode::External),
            },
            vector_vector: CategoryRules {
                ram_style: Threshold::new(0, RamStyle::Auto),
                res_type: Threshold::new(0, ResType::Dsp),
                mem_mode: Threshold::new(0, MemMode::Const),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSummary {
    pub patched: Vec<String>,
    pub skipped: Vec<String>,
}

impl FoldingRules {
    pub fn load(path: &Path) -> Result<Self, FoldingError> {
        let text = read(path)?;
        serde_json::from_str(&text).map_err(|source| FoldingError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn rules_for(&self, category: LayerCategory) -> &CategoryRules {
        match category {
            LayerCategory::MatrixVector => &self.matrix_vector,
            LayerCategory::VectorVector => &self.vector_vector,
        }
    }

    /// Patch every categorised layer of `config` in place.
    pub fn apply(&self, config: &mut Map<String, Value>) -> Result<PatchSummary, FoldingError> {
        let mut summary = PatchSummary::default();

        for (name, entry) in config.iter_mut() {
            let Some(layer) = LayerId::parse(name)? else {
                debug!("leaving '{}' untouched", name);
                summary.skipped.push(name.clone());
                continue;
            };
            let attrs = entry
                .as_object_mut()
                .ok_or_else(|| FoldingError::InvalidLayerEntry(name.clone()))?;

            let rules = self.rules_for(layer.category);
            let mut touched = false;
            if rules.ram_style.applies_to(layer.index) {
                attrs.insert("ram_style".to_string(), to_value(rules.ram_style.value));
                if rules.ram_style.value == RamStyle::Ultra {
                    attrs.insert("runtime_writeable_weights".to_string(), Value::from(1));
                }
                touched = true;
            }
            if rules.res_type.applies_to(layer.index) {
                attrs.insert("resType".to_string(), to_value(rules.res_type.value));
                touched = true;
            }
            if rules.mem_mode.applies_to(layer.index) {
                attrs.insert("mem_mode".to_string(), to_value(rules.mem_mode.value));
                touched = true;
            }

            if touched {
                summary.patched.push(name.clone());
            } else {
                summary.skipped.push(name.clone());
            }
        }

        Ok(summary)
    }

    /// Read a folding config from `input`, patch it and write it to `output`
    /// (pretty-printed, key order preserved).
    pub fn patch_file(&self, input: &Path, output: &Path) -> Result<PatchSummary, FoldingError> {
        let text = read(input)?;
        let value: Value = serde_json::from_str(&text).map_err(|source| FoldingError::Json {
            path: input.to_path_buf(),
            source,
        })?;
        let Value::Object(mut config) = value else {
            return Err(FoldingError::NotAnObject);
        };

        let summary = self.apply(&mut config)?;
        if summary.patched.is_empty() {
            warn!("no layers in '{}' matched the folding rules", input.display());
        }

        let mut pretty = serde_json::to_string_pretty(&Value::Object(config)).map_err(|source| {
            FoldingError::Json {
                path: output.to_path_buf(),
                source,
            }
        })?;
        pretty.push('\n');
        fs::write(output, pretty).map_err(|source| FoldingError::Write {
            path: output.to_path_buf(),
            source,
        })?;
        Ok(summary)
    }
}

fn read(path: &Path) -> Result<String, FoldingError> {
    fs::read_to_string(path).map_err(|source| FoldingError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn to_value<T: Serialize>(v: T) -> Value {
    // Unit enum variants always serialize to strings.
    serde_json::to_value(v).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn parses_layer_names() {
        assert_eq!(
            LayerId::parse("MatrixVectorActivation_12").unwrap(),
            Some(LayerId {
                category: LayerCategory::MatrixVector,
                index: 12
            })
        );
        assert_eq!(
            LayerId::parse("VVAU_rtl_3").unwrap(),
            Some(LayerId {
                category: LayerCategory::VectorVector,
                index: 3
            })
        );
        assert_eq!(LayerId::parse("Defaults").unwrap(), None);
        assert_eq!(LayerId::parse("Thresholding_rtl_0").unwrap(), None);
        assert!(matches!(
            LayerId::parse("MVAU_hls_x"),
            Err(FoldingError::InvalidLayerIndex(_))
        ));
        assert!(LayerId::parse("MVAU").is_err());
    }

    #[test]
    fn default_rules_follow_thresholds() {
        let mut cfg = object(json!({
            "Defaults": {},
            "MatrixVectorActivation_0": {"PE": 4, "SIMD": 8},
            "MatrixVectorActivation_33": {"PE": 2},
            "VectorVectorActivation_1": {"PE": 1},
        }));
        let summary = FoldingRules::default().apply(&mut cfg).unwrap();
        assert_eq!(summary.skipped, vec!["Defaults"]);
        assert_eq!(summary.patched.len(), 3);

        assert_eq!(
            cfg["MatrixVectorActivation_0"],
            json!({"PE": 4, "SIMD": 8, "resType": "dsp"})
        );
        assert_eq!(
            cfg["MatrixVectorActivation_33"],
            json!({"PE": 2, "ram_style": "auto", "resType": "dsp", "mem_mode": "external"})
        );
        assert_eq!(
            cfg["VectorVectorActivation_1"],
            json!({"PE": 1, "ram_style": "auto", "resType": "dsp", "mem_mode": "const"})
        );
        assert_eq!(cfg["Defaults"], json!({}));
    }

    #[test]
    fn ultra_ram_style_makes_weights_writeable() {
        let mut rules = FoldingRules::default();
        rules.matrix_vector.ram_style = Threshold::new(2, RamStyle::Ultra);
        let mut cfg = object(json!({
            "MVAU_hls_1": {},
            "MVAU_hls_2": {},
        }));
        rules.apply(&mut cfg).unwrap();
        assert!(cfg["MVAU_hls_1"].get("runtime_writeable_weights").is_none());
        assert_eq!(cfg["MVAU_hls_2"]["ram_style"], json!("ultra"));
        assert_eq!(cfg["MVAU_hls_2"]["runtime_writeable_weights"], json!(1));
    }

    #[test]
    fn non_object_layer_entry_is_an_error() {
        let mut cfg = object(json!({"MVAU_hls_0": 5}));
        assert!(matches!(
            FoldingRules::default().apply(&mut cfg),
            Err(FoldingError::InvalidLayerEntry(_))
        ));
    }

    #[test]
    fn rules_deserialize_with_defaults() {
        let rules: FoldingRules = serde_json::from_str(
            r#"{"vector_vector": {
                "ram_style": {"from_idx": 4, "value": "block"},
                "res_type": {"from_idx": 0, "value": "lut"},
                "mem_mode": {"from_idx": 0, "value": "decoupled"}
            }}"#,
        )
        .unwrap();
        assert_eq!(rules.matrix_vector, FoldingRules::default().matrix_vector);
        assert_eq!(rules.vector_vector.ram_style, Threshold::new(4, RamStyle::Block));
        assert_eq!(rules.vector_vector.mem_mode.value, MemMode::Decoupled);
    }
}
