// Numerical equivalence oracle: run two graphs on the same sampled inputs and
// compare their declared outputs element-wise. A spot check, not a proof.
use crate::exec::{execute_graph, ExecError};
use crate::ir::{Graph, Tensor};
use log::debug;
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("graphs declare different output counts: {original} vs {rewritten}")]
    OutputArity { original: usize, rewritten: usize },
}

/// `|a - b| <= atol + rtol * |b|`, as in numpy's `isclose`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerance {
    pub rtol: f32,
    pub atol: f32,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            rtol: 1e-5,
            atol: 1e-3,
        }
    }
}

impl Tolerance {
    pub fn is_close(&self, a: f32, b: f32) -> bool {
        (a - b).abs() <= self.atol + self.rtol * b.abs()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Number of random input assignments to try.
    pub samples: usize,
    pub seed: u64,
    #[serde(flatten)]
    pub tolerance: Tolerance,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            samples: 1,
            seed: 0,
            tolerance: Tolerance::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Divergence {
    Shape {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    Values {
        max_abs_diff: f32,
        /// Flat (row-major) index of the largest difference.
        worst_index: usize,
        mismatched: usize,
        total: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputDivergence {
    pub output: String,
    pub sample: usize,
    pub divergence: Divergence,
}

impl fmt::Display for OutputDivergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.divergence {
            Divergence::Shape { expected, got } => write!(
                f,
                "output '{}' (sample {}): shape {:?} != {:?}",
                self.output, self.sample, got, expected
            ),
            Divergence::Values {
                max_abs_diff,
                worst_index,
                mismatched,
                total,
            } => write!(
                f,
                "output '{}' (sample {}): {}/{} elements differ, max |diff| {} at index {}",
                self.output, self.sample, mismatched, total, max_abs_diff, worst_index
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EquivalenceReport {
    pub samples: usize,
    pub outputs_compared: usize,
    pub divergences: Vec<OutputDivergence>,
}

impl EquivalenceReport {
    pub fn is_equivalent(&self) -> bool {
        self.divergences.is_empty()
    }
}

impl fmt::Display for EquivalenceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_equivalent() {
            return write!(
                f,
                "{} output(s) match over {} sample(s)",
                self.outputs_compared, self.samples
            );
        }
        for (i, d) in self.divergences.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}

/// Uniform `[0, 1)` tensors for every graph input.
pub fn sample_inputs<R: Rng>(graph: &Graph, rng: &mut R) -> HashMap<String, Tensor> {
    graph
        .inputs
        .iter()
        .map(|decl| {
            let tensor = ArrayD::from_shape_fn(IxDyn(&decl.shape), |_| rng.gen::<f32>());
            (decl.name.clone(), tensor)
        })
        .collect()
}

/// Execute both graphs on `inputs` and compare outputs position by position.
pub fn compare_execution(
    original: &Graph,
    rewritten: &Graph,
    inputs: &HashMap<String, Tensor>,
    tolerance: Tolerance,
) -> Result<EquivalenceReport, OracleError> {
    let mut report = EquivalenceReport {
        samples: 1,
        ..Default::default()
    };
    compare_sample(original, rewritten, inputs, tolerance, 0, &mut report)?;
    Ok(report)
}

/// Run the oracle over `config.samples` seeded random input assignments.
pub fn check_equivalence(
    original: &Graph,
    rewritten: &Graph,
    config: &OracleConfig,
) -> Result<EquivalenceReport, OracleError> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut report = EquivalenceReport::default();
    for sample in 0..config.samples.max(1) {
        let inputs = sample_inputs(original, &mut rng);
        compare_sample(
            original,
            rewritten,
            &inputs,
            config.tolerance,
            sample,
            &mut report,
        )?;
        report.samples += 1;
    }
    Ok(report)
}

fn compare_sample(
    original: &Graph,
    rewritten: &Graph,
    inputs: &HashMap<String, Tensor>,
    tolerance: Tolerance,
    sample: usize,
    report: &mut EquivalenceReport,
) -> Result<(), OracleError> {
    if original.outputs.len() != rewritten.outputs.len() {
        return Err(OracleError::OutputArity {
            original: original.outputs.len(),
            rewritten: rewritten.outputs.len(),
        });
    }

    let expected = execute_graph(original, inputs)?;
    let actual = execute_graph(rewritten, inputs)?;

    report.outputs_compared = original.outputs.len();
    for (name_a, name_b) in original.outputs.iter().zip(&rewritten.outputs) {
        let a = &expected[name_a];
        let b = &actual[name_b];
        if let Some(divergence) = compare_tensors(a, b, tolerance) {
            debug!("output '{}' diverged: {:?}", name_a, divergence);
            report.divergences.push(OutputDivergence {
                output: name_a.clone(),
                sample,
                divergence,
            });
        }
    }
    Ok(())
}

fn compare_tensors(expected: &Tensor, actual: &Tensor, tolerance: Tolerance) -> Option<Divergence> {
    if expected.shape() != actual.shape() {
        return Some(Divergence::Shape {
            expected: expected.shape().to_vec(),
            got: actual.shape().to_vec(),
        });
    }

    let mut max_abs_diff = 0.0f32;
    let mut worst_index = 0usize;
    let mut mismatched = 0usize;
    for (idx, (&e, &a)) in expected.iter().zip(actual.iter()).enumerate() {
        // NaN never compares close, so it always counts as a mismatch.
        if !tolerance.is_close(a, e) {
            mismatched += 1;
            let diff = (a - e).abs();
            if diff > max_abs_diff || diff.is_nan() {
                max_abs_diff = diff;
                worst_index = idx;
            }
        }
    }

    (mismatched > 0).then(|| Divergence::Values {
        max_abs_diff,
        worst_index,
        mismatched,
        total: expected.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ConvAttrs, GraphBuilder, Op};

    fn scaled(scale: f32) -> Graph {
        GraphBuilder::new("g")
            .input("x", &[1, 1, 3, 3])
            .output("y")
            .initializer("s", ArrayD::from_elem(IxDyn(&[1]), scale))
            .initializer("w", ArrayD::from_elem(IxDyn(&[1, 1, 2, 2]), 0.25))
            .node(Op::Mul, &["x", "s"], &["m"])
            .node(Op::Conv(ConvAttrs::new([2, 2])), &["m", "w"], &["y"])
            .build()
            .unwrap()
    }

    #[test]
    fn identical_graphs_are_equivalent() {
        let g = scaled(2.0);
        let report = check_equivalence(&g, &g.clone(), &OracleConfig::default()).unwrap();
        assert!(report.is_equivalent());
        assert_eq!(report.samples, 1);
        assert_eq!(report.outputs_compared, 1);
    }

    #[test]
    fn scale_change_is_reported_with_location() {
        let config = OracleConfig {
            samples: 3,
            ..Default::default()
        };
        let report = check_equivalence(&scaled(2.0), &scaled(3.0), &config).unwrap();
        assert!(!report.is_equivalent());
        assert_eq!(report.divergences.len(), 3);
        match &report.divergences[0].divergence {
            Divergence::Values {
                max_abs_diff,
                mismatched,
                total,
                ..
            } => {
                assert!(*max_abs_diff > 0.0);
                assert_eq!(*total, 4);
                assert!(*mismatched > 0);
            }
            other => panic!("unexpected divergence {:?}", other),
        }
        assert!(report.to_string().contains("output 'y'"));
    }

    #[test]
    fn tolerance_uses_relative_and_absolute_terms() {
        let tol = Tolerance {
            rtol: 1e-3,
            atol: 0.0,
        };
        assert!(tol.is_close(1000.5, 1000.0));
        assert!(!tol.is_close(1.5, 1.0));
        assert!(!tol.is_close(f32::NAN, f32::NAN));
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let g = scaled(1.0);
        let a = sample_inputs(&g, &mut StdRng::seed_from_u64(7));
        let b = sample_inputs(&g, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
        assert!(a["x"].iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn oracle_config_fields_default() {
        let cfg: OracleConfig = serde_json::from_str(r#"{"samples": 4, "atol": 0.01}"#).unwrap();
        assert_eq!(cfg.samples, 4);
        assert_eq!(cfg.seed, 0);
        assert_eq!(cfg.tolerance.atol, 0.01);
        assert_eq!(cfg.tolerance.rtol, 1e-5);
    }
}
