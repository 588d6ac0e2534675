use anyhow::Context;
use orderflow_engine::{EngineConfig, FlowEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let (config_path, symbol) = parse_args(&args);

    let mut config = match config_path {
        Some(path) => EngineConfig::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => EngineConfig::default(),
    };
    if let Some(symbol) = symbol {
        config.symbol = symbol.to_uppercase();
    }
    config.validate().context("invalid configuration")?;

    tracing::info!(symbol = %config.symbol, "Starting order-flow engine...");

    let engine = FlowEngine::new(config).context("failed to assemble engine")?;
    let mut signals = engine.subscribe_signals();
    let mut anomalies = engine.subscribe_anomalies();

    // Demo subscribers: real deployments hang alerting/persistence/UI
    // fan-out off these broadcast channels.
    tokio::spawn(async move {
        while let Ok(signal) = signals.recv().await {
            tracing::info!(
                source = signal.candidate.source.as_str(),
                side = ?signal.candidate.side,
                price = %signal.final_price,
                confidence = signal.candidate.confidence,
                "SIGNAL"
            );
        }
    });
    tokio::spawn(async move {
        while let Ok(anomaly) = anomalies.recv().await {
            tracing::warn!(
                kind = anomaly.kind.as_str(),
                severity = ?anomaly.severity,
                action = %anomaly.recommended_action,
                "ANOMALY"
            );
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal (Ctrl+C)");
                let _ = shutdown_tx.send(());
            }
            Err(err) => {
                tracing::error!("Failed to listen for shutdown signal: {}", err);
            }
        }
    });

    engine.run(shutdown_rx).await.context("engine terminated")?;
    tracing::info!("Engine stopped");
    Ok(())
}

/// Parse command-line arguments
fn parse_args(args: &[String]) -> (Option<String>, Option<String>) {
    let mut config_path = None;
    let mut symbol = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                if i + 1 < args.len() {
                    config_path = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--symbol" => {
                if i + 1 < args.len() {
                    symbol = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    (config_path, symbol)
}

/// Print usage information
fn print_usage() {
    println!("orderflow-engine - streaming order-flow signal engine for one trading pair");
    println!();
    println!("USAGE:");
    println!("    orderflow-engine [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <PATH>     JSON config file (missing fields take defaults)");
    println!("    --symbol <SYMBOL>   Trading pair override (e.g. BTCUSDT)");
    println!("    --help, -h          Print this help message");
    println!();
    println!("ENVIRONMENT VARIABLES:");
    println!("    RUST_LOG            Logging filter (default: info)");
}
