use anyhow::Context;
use clap::Parser;
use segflow::graph::Graph;
use segflow::manifest::Manifest;
use segflow::pipeline::compile_graph;
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Partitions a serialized graph into fused segments and compiles them
/// with an external ahead-of-time compiler.
#[derive(Parser, Debug)]
#[command(name = "segflow", version)]
struct Cli {
    /// Manifest (JSON) describing the run.
    manifest: PathBuf,

    /// Input graph; overrides `graph` in the manifest.
    #[arg(short, long)]
    graph: Option<PathBuf>,

    /// Output path; overrides `output` in the manifest.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log filter, e.g. `info` or `segflow=debug`.
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let json = fs::read_to_string(&cli.manifest)
        .with_context(|| format!("reading manifest {}", cli.manifest.display()))?;
    let manifest = Manifest::from_json(&json)?;

    let graph_path = cli.graph.or_else(|| manifest.graph.clone()).context("no input graph given")?;
    let output_path = cli.output.or_else(|| manifest.output.clone()).context("no output path given")?;

    info!(graph = %graph_path.display(), "loading graph");
    let bytes = fs::read(&graph_path).with_context(|| format!("reading graph {}", graph_path.display()))?;
    let graph = Graph::decode(&bytes)?;

    let ctx = compile_graph(graph, manifest)?;

    fs::write(&output_path, ctx.graph.encode())
        .with_context(|| format!("writing {}", output_path.display()))?;
    info!(
        output = %output_path.display(),
        compiled = ctx.compile.compiled().len(),
        restored = ctx.recovery.restored.len(),
        "done"
    );
    Ok(())
}
