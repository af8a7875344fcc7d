use axum::{routing::get, Router};
use chanwin_core::config::PipelineConfig;
use chanwin_core::{BatchWriter, ChannelOutcome, Pipeline, RunReport};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(name = "chanwin", version, about = "Channel window reduction CLI", disable_help_subcommand = false)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a pipeline from a pipeline.toml
    Run {
        #[arg(short, long)]
        config: std::path::PathBuf,
        #[arg(long, default_value_t = 0)]
        http_port: u16,
    },
    /// Serve only /metrics
    Serve {
        #[arg(long, default_value_t = 9898)]
        port: u16,
    },
}

fn app() -> Router {
    Router::new().route("/metrics", get(metrics))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { port } => {
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            tracing::info!("serving /metrics on {}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app()).await?;
            Ok(())
        }
        Commands::Run { config, http_port } => {
            if http_port != 0 {
                let addr = SocketAddr::from(([127, 0, 0, 1], http_port));
                let listener = tokio::net::TcpListener::bind(addr).await?;
                tokio::spawn(async move {
                    let _ = axum::serve(listener, app()).await;
                });
            }
            let text = tokio::fs::read_to_string(&config).await?;
            let cfg = parse_config(&text)?;
            match run_pipeline(&cfg).await {
                Ok(report) => {
                    log_report(&report);
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(error = %e, "pipeline failed");
                    Err(e)
                }
            }
        }
    }
}

async fn metrics() -> String {
    chanwin_core::metrics::render_prometheus()
}

fn parse_config(text: &str) -> anyhow::Result<PipelineConfig> {
    let cfg: PipelineConfig = toml::from_str(text)?;
    cfg.validate()?;
    Ok(cfg)
}

async fn run_pipeline(cfg: &PipelineConfig) -> anyhow::Result<RunReport> {
    let source = chanwin_io::build_source(&cfg.source).await?;
    let sink = chanwin_io::build_sink(&cfg.sink).await?;
    let operator = chanwin_ops::from_config(&cfg.transform)?;
    let writer = BatchWriter::new(sink, cfg.write.mode, cfg.write.batch_size, cfg.write.timeout()?);
    Ok(Pipeline::new(source, operator, writer, cfg.channels.range()).run().await?)
}

fn log_report(report: &RunReport) {
    for c in &report.channels {
        if let ChannelOutcome::Abandoned { reason } = &c.outcome {
            tracing::warn!(channel = c.channel, records = c.records_read, %reason, "channel abandoned");
        }
    }
    tracing::info!(
        channels = report.channels.len(),
        written = report.writes.written,
        item_failures = report.writes.item_failures,
        "run complete in {}",
        chanwin_core::progress::fmt_hms(report.elapsed)
    );
}
