mod model;

use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::{Context, IntoDiagnostic};

use qatfuse_ir::{Graph, Node, NodeId, OpKind, Operand, dump_graph};
use qatfuse_kernels::{evaluate, max_abs_diff};

/// qatfuse: conv + batch norm fusion for quantization-aware training
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fuse a float conv + batch norm model into its QAT form
    Train(ModelArgs),
    /// Fold the batch norm of a converted QAT model into the convolution
    Convert {
        #[command(flatten)]
        model: ModelArgs,

        /// Quantize weights per output channel instead of per tensor
        #[arg(long)]
        per_channel: bool,
    },
}

#[derive(Args)]
struct ModelArgs {
    /// Build the convolution without a bias
    #[arg(long)]
    no_bias: bool,

    /// Output channels of the convolution
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..))]
    channels: u16,

    /// Dump the graph to stderr before and after the rewrite
    #[arg(long)]
    emit_graph: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => train(&args),
        Command::Convert { model, per_channel } => convert(&model, per_channel),
    }
}

fn emit(enabled: bool, label: &str, graph: &Graph) {
    if enabled {
        eprintln!("== {label} ==\n{}", dump_graph(graph));
    }
}

fn forward(graph: &Graph) -> miette::Result<ndarray::ArrayD<f64>> {
    evaluate(graph, &[model::input()])
        .into_diagnostic()
        .wrap_err("reference evaluation failed")?
        .into_iter()
        .next()
        .ok_or_else(|| miette::miette!("graph has no outputs"))
}

fn train(args: &ModelArgs) -> miette::Result<()> {
    let graph = model::float_model(usize::from(args.channels), !args.no_bias);
    emit(args.emit_graph, "before", &graph);
    let expected = forward(&graph)?;

    let fused = qatfuse_opt::fuse_training(graph)
        .into_diagnostic()
        .wrap_err("training fusion failed")?;
    emit(args.emit_graph, "after", &fused);
    let actual = forward(&fused)?;

    let diff = max_abs_diff(&expected, &actual).ok_or_else(|| {
        miette::miette!(
            "fused output shape {:?} differs from {:?}",
            actual.shape(),
            expected.shape()
        )
    })?;
    println!("nodes: {}", fused.node_count());
    println!("max abs diff (fused vs unfused): {diff:e}");
    Ok(())
}

/// Follows first operands from `id` down to the constant that feeds it.
fn feeding_constant(graph: &Graph, mut id: NodeId) -> Option<&str> {
    loop {
        let node = graph.node(id)?;
        match &node.kind {
            OpKind::GetAttr { target } => return Some(target.as_str()),
            _ => id = node.operand(0).and_then(Operand::as_node)?,
        }
    }
}

fn print_constant(graph: &Graph, role: &str, conv: &Node, index: usize) {
    let name = conv
        .operand(index)
        .and_then(Operand::as_node)
        .and_then(|id| feeding_constant(graph, id));
    match name.and_then(|n| graph.constant(n).map(|t| (n, t))) {
        Some((name, value)) => println!("{role} ({name}):\n{value}"),
        None => println!("{role}: none"),
    }
}

fn convert(args: &ModelArgs, per_channel: bool) -> miette::Result<()> {
    let graph = model::converted_model(usize::from(args.channels), !args.no_bias, per_channel);
    emit(args.emit_graph, "before", &graph);

    let folded = qatfuse_opt::fold_quantized(graph)
        .into_diagnostic()
        .wrap_err("quantized folding failed")?;
    emit(args.emit_graph, "after", &folded);

    let conv = folded
        .nodes()
        .iter()
        .find(|n| n.kind == OpKind::Convolution)
        .ok_or_else(|| miette::miette!("folded graph has no convolution"))?;
    println!("nodes: {}", folded.node_count());
    print_constant(&folded, "folded weight", conv, 1);
    print_constant(&folded, "folded bias", conv, 2);

    let out = forward(&folded)?;
    println!("output shape: {:?}", out.shape());
    Ok(())
}
