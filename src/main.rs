use clap::{Parser, Subcommand};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

use scalar_streamline::ast::GraphJson;
use scalar_streamline::config::{StreamlineConfig, TransformKind};
use scalar_streamline::equivalence::{check_equivalence, OracleConfig};
use scalar_streamline::folding::FoldingRules;
use scalar_streamline::ir::{graph_from_json, graph_to_json, Graph};
use scalar_streamline::streamline::Streamliner;

#[derive(Parser)]
#[command(name = "scalar-streamline")]
#[command(about = "Move scalar Add/Mul nodes past convolutions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that a graph is well formed and print its op sequence.
    Validate { path: PathBuf },
    /// Apply the streamlining transforms, checking each rewrite numerically.
    Streamline {
        path: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Run only these transforms (overrides the config's list).
        #[arg(long = "transform", value_enum)]
        transforms: Vec<TransformKind>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Execute two graphs on the same random inputs and compare outputs.
    Compare {
        original: PathBuf,
        rewritten: PathBuf,
        #[arg(long, default_value_t = 1)]
        samples: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Rewrite resource attributes in a folding configuration.
    PatchFolding {
        path: PathBuf,
        #[arg(long)]
        rules: Option<PathBuf>,
        /// Defaults to rewriting the input file in place.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

/// Load a graph from JSON, or from an ONNX model when built with `onnx`
/// (auto-detected by extension).
fn load_graph(path: &Path) -> anyhow::Result<Graph> {
    let json = if path.extension().is_some_and(|e| e == "onnx") {
        load_onnx(path)?
    } else {
        let content = fs::read_to_string(path)?;
        if !content.trim_start().starts_with('{') {
            anyhow::bail!("{}: expected a JSON graph", path.display());
        }
        serde_json::from_str::<GraphJson>(&content)?
    };
    Ok(graph_from_json(&json)?)
}

#[cfg(feature = "onnx")]
fn load_onnx(path: &Path) -> anyhow::Result<GraphJson> {
    let model = scalar_streamline::onnx::load_onnx_model(path)?;
    Ok(scalar_streamline::onnx::import_model(&model)?)
}

#[cfg(not(feature = "onnx"))]
fn load_onnx(path: &Path) -> anyhow::Result<GraphJson> {
    anyhow::bail!(
        "{}: ONNX input requires building with the 'onnx' feature",
        path.display()
    )
}

fn op_sequence(graph: &Graph) -> String {
    graph
        .op_kinds()
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.cmd {
        Command::Validate { path } => {
            let g = load_graph(&path)?;
            eprintln!("OK: {}", op_sequence(&g));
        }
        Command::Streamline {
            path,
            config,
            transforms,
            output,
        } => {
            let mut cfg = match config {
                Some(p) => StreamlineConfig::load(&p)?,
                None => StreamlineConfig::default(),
            };
            if !transforms.is_empty() {
                cfg.transforms = transforms;
            }

            let g = load_graph(&path)?;
            info!("before: {}", op_sequence(&g));
            let report = Streamliner::from_config(&cfg).run(&g)?;
            eprintln!(
                "applied {} rewrite(s): {}",
                report.applied.len(),
                op_sequence(&report.graph)
            );

            let json = serde_json::to_string_pretty(&graph_to_json(&report.graph))?;
            match output {
                Some(out) => {
                    fs::write(&out, json)?;
                    eprintln!("Wrote streamlined graph to: {}", out.display());
                }
                None => println!("{}", json),
            }
        }
        Command::Compare {
            original,
            rewritten,
            samples,
            seed,
        } => {
            let a = load_graph(&original)?;
            let b = load_graph(&rewritten)?;
            let oracle = OracleConfig {
                samples,
                seed,
                ..OracleConfig::default()
            };
            let report = check_equivalence(&a, &b, &oracle)?;
            if !report.is_equivalent() {
                anyhow::bail!("graphs differ: {}", report);
            }
            eprintln!("OK: {}", report);
        }
        Command::PatchFolding {
            path,
            rules,
            output,
        } => {
            let rules = match rules {
                Some(p) => FoldingRules::load(&p)?,
                None => FoldingRules::default(),
            };
            let out = output.unwrap_or_else(|| path.clone());
            let summary = rules.patch_file(&path, &out)?;
            eprintln!(
                "patched {} layer(s), left {} untouched: {}",
                summary.patched.len(),
                summary.skipped.len(),
                out.display()
            );
        }
    }

    Ok(())
}
