use clap::Parser;
use workerfarm_worker::{init_child_tracing, run_worker_main, ModuleRegistry};

#[derive(Parser, Debug)]
#[command(name = "farm-worker")]
#[command(about = "Child process hosting worker farm task modules", long_about = None)]
struct Args {
    /// Task module to serve
    #[arg(short, long)]
    module: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout carries the channel, so tracing goes to stderr
    init_child_tracing();

    run_worker_main(&ModuleRegistry::with_builtins(), &args.module).await
}
