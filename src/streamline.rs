// Equivalence-gated rewriting. Every rewrite is checked against the graph it
// came from before it is accepted; a rule that declines and a rule that
// breaks the graph's function are reported differently.
use crate::config::StreamlineConfig;
use crate::equivalence::{check_equivalence, EquivalenceReport, OracleConfig, OracleError};
use crate::ir::Graph;
use crate::transform::{TransformError, Transformation};
use log::info;
use thiserror::Error;

/// Rounds over the whole transform list before giving up on convergence.
const MAX_ROUNDS: usize = 16;

#[derive(Debug, Error)]
pub enum StreamlineError {
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error("transform '{transform}' changed the graph's output: {report}")]
    NotEquivalent {
        transform: &'static str,
        report: EquivalenceReport,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The rule rewrote the graph and the result passed the oracle.
    Applied(Graph),
    /// The rule found nothing to do; the input graph stands.
    NotApplicable,
}

/// Apply one transformation and accept the result only if it is
/// numerically equivalent to `graph`.
pub fn apply_checked(
    graph: &Graph,
    transformation: &dyn Transformation,
    oracle: &OracleConfig,
) -> Result<Outcome, StreamlineError> {
    let rewritten = graph.transform(transformation)?;
    if rewritten == *graph {
        return Ok(Outcome::NotApplicable);
    }

    let report = check_equivalence(graph, &rewritten, oracle)?;
    if !report.is_equivalent() {
        return Err(StreamlineError::NotEquivalent {
            transform: transformation.name(),
            report,
        });
    }
    info!("{}: accepted ({})", transformation.name(), report);
    Ok(Outcome::Applied(rewritten))
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamlineReport {
    pub graph: Graph,
    /// Names of the transformations that changed the graph, in order.
    pub applied: Vec<&'static str>,
}

pub struct Streamliner {
    transforms: Vec<Box<dyn Transformation>>,
    oracle: OracleConfig,
}

impl Streamliner {
    pub fn new(transforms: Vec<Box<dyn Transformation>>, oracle: OracleConfig) -> Self {
        Self { transforms, oracle }
    }

    pub fn from_config(config: &StreamlineConfig) -> Self {
        Self::new(
            config.transforms.iter().map(|t| t.build()).collect(),
            config.oracle.clone(),
        )
    }

    /// Run every transformation in turn, repeating the list until a full
    /// round changes nothing.
    pub fn run(&self, graph: &Graph) -> Result<StreamlineReport, StreamlineError> {
        let mut current = graph.clone();
        let mut applied = Vec::new();

        for _ in 0..MAX_ROUNDS {
            let mut changed = false;
            for t in &self.transforms {
                if let Outcome::Applied(next) = apply_checked(&current, t.as_ref(), &self.oracle)? {
                    current = next;
                    applied.push(t.name());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        Ok(StreamlineReport {
            graph: current,
            applied,
        })
    }
}
