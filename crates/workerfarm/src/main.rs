use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workerfarm::{FarmConfig, LogLevel, WorkerFarm};

#[derive(Parser, Debug)]
#[command(name = "workerfarm")]
#[command(about = "Run calls on a pool of worker processes", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Task module to run (overrides the config file)
    #[arg(short, long)]
    module: Option<String>,

    /// Upper bound on worker processes
    #[arg(long)]
    max_workers: Option<usize>,

    /// Options passed to every worker's init, as JSON
    #[arg(long, default_value = "null")]
    options: String,

    /// Number of times to run the call
    #[arg(short = 'n', long, default_value = "1")]
    repeat: usize,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Call arguments, each parsed as JSON (bare words become strings)
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    if args.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }

    // Load configuration
    let mut config = match &args.config {
        Some(path) => FarmConfig::from_file(path)?,
        None => FarmConfig::default(),
    };
    if let Some(module) = args.module {
        config.worker.module = module;
    }
    if args.max_workers.is_some() {
        config.max_workers = args.max_workers;
    }
    if args.config.is_none() {
        // The worker binary ships next to this one
        let exe = std::env::current_exe()?;
        if let Some(dir) = exe.parent() {
            config.worker.program = dir.join("farm-worker");
        }
    }
    config.validate()?;

    let options: Value = serde_json::from_str(&args.options)?;
    let call_args: Vec<Value> = args
        .args
        .iter()
        .map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone())))
        .collect();

    let farm = WorkerFarm::new(config, options).await?;

    let _events = farm.log_bus().subscribe(|event| match event.level {
        LogLevel::Info => tracing::info!(source = ?event.source, "{}", event.message),
        LogLevel::Warn => tracing::warn!(source = ?event.source, "{}", event.message),
        LogLevel::Error => tracing::error!(source = ?event.source, "{}", event.message),
    });

    let calls = (0..args.repeat).map(|_| farm.run(call_args.clone()));
    let results = futures::future::join_all(calls).await;

    let mut failed = 0;
    for result in results {
        match result {
            Ok(value) => println!("{}", value),
            Err(e) => {
                failed += 1;
                eprintln!("error: {}", e);
            }
        }
    }

    tracing::info!(
        workers = farm.pool_size(),
        remote = farm.should_use_remote_workers(),
        "Finished {} call(s)",
        args.repeat
    );
    farm.end().await;

    if failed > 0 {
        anyhow::bail!("{} of {} call(s) failed", failed, args.repeat);
    }
    Ok(())
}
