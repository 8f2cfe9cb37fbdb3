use clap::Parser;
use redo_capture::{Config, Replicator};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "redo-capture")]
#[command(about = "Redo-log change data capture replicator", long_about = None)]
#[command(version)]
struct Args {
    #[arg(help = "Path to the JSON configuration file")]
    config: std::path::PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting redo-capture v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let source = config.source();
    info!(
        source = %source.alias,
        database = %source.name,
        reader = ?source.reader.reader_type,
        writer = ?config.target().writer.writer_type,
        "Configuration summary"
    );

    let mut replicator = Replicator::new(config, Some(args.config.clone()));
    match replicator.run().await {
        Ok(()) => {
            info!("Replication completed successfully");
        }
        Err(e) => {
            error!(code = e.code(), "Replication failed: {e}");
            std::process::exit(i32::try_from(e.code() % 100).unwrap_or(1).max(1));
        }
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("redo_capture=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("redo_capture=info,warn"))
    };

    // Timestamp prefixes follow the locale toggle used in production
    // deployments.
    let with_time = std::env::var("OLR_LOCALES").map(|v| v != "0").unwrap_or(true);

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else if with_time {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .without_time()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
