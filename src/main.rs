//! Coinpilot - headless autopilot orchestrator
//!
//! Runs the orchestrator against the guided-trading backend (or scripted
//! mocks) without a UI. State snapshots surface through the sink; logs go
//! to stdout via tracing.
//!
//! # Usage
//! ```sh
//! AUTOPILOT_BACKEND_URL=http://localhost:8044 cargo run -- --mode http
//! cargo run -- --mode mock --once
//! ```

use std::env;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use coinpilot::application::orchestrator::{Orchestrator, Services};
use coinpilot::config::{AutopilotConfig, Mode};
use coinpilot::domain::ports::{AutopilotSink, GuidedTradingApi, LlmClient, McpClient};
use coinpilot::domain::types::AutopilotState;
use coinpilot::infrastructure::backend::HttpGuidedTradingApi;
use coinpilot::infrastructure::llm::HttpLlmGateway;
use coinpilot::infrastructure::mcp::HttpMcpBridge;
use coinpilot::infrastructure::mock::{MockGuidedTradingApi, MockLlmClient, MockMcpClient};

#[derive(Parser)]
#[command(name = "coinpilot", about = "Autonomous guided-trading orchestrator")]
struct Cli {
    /// Service wiring: 'http' against real endpoints, 'mock' for a demo run
    #[arg(long, default_value = "mock")]
    mode: String,

    /// Run a single orchestrator tick and exit
    #[arg(long)]
    once: bool,
}

/// Sink logging a one-line digest of every snapshot.
struct LogSink;

impl AutopilotSink for LogSink {
    fn on_state(&self, state: AutopilotState) {
        info!(
            "State: running={} blocked={} candidates={} workers={} events={} llm_used={}",
            state.running,
            state.blocked_by_daily_loss,
            state.candidates.len(),
            state.workers.len(),
            state.events.len(),
            state.llm_usage.used_today
        );
    }

    fn on_log(&self, line: &str) {
        info!("{line}");
    }
}

fn build_services(mode: Mode) -> Services {
    match mode {
        Mode::Mock => Services {
            backend: Arc::new(MockGuidedTradingApi::demo()) as Arc<dyn GuidedTradingApi>,
            llm: Arc::new(MockLlmClient::new()) as Arc<dyn LlmClient>,
            mcp: Arc::new(MockMcpClient::new()) as Arc<dyn McpClient>,
            sink: Arc::new(LogSink),
        },
        Mode::Http => {
            let backend_url = env::var("AUTOPILOT_BACKEND_URL")
                .unwrap_or_else(|_| "http://localhost:8044".to_string());
            let backend_token = env::var("AUTOPILOT_BACKEND_TOKEN").ok();
            let llm_url = env::var("AUTOPILOT_LLM_GATEWAY_URL")
                .unwrap_or_else(|_| "http://localhost:8090".to_string());
            let llm_key = env::var("AUTOPILOT_LLM_API_KEY").ok();
            let mcp_url = env::var("AUTOPILOT_MCP_BRIDGE_URL")
                .unwrap_or_else(|_| "http://localhost:8931".to_string());
            Services {
                backend: Arc::new(HttpGuidedTradingApi::new(backend_url, backend_token)),
                llm: Arc::new(HttpLlmGateway::new(llm_url, llm_key)),
                mcp: Arc::new(HttpMcpBridge::new(mcp_url)),
                sink: Arc::new(LogSink),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mode = Mode::from_str(&cli.mode)?;
    let config = AutopilotConfig::from_env()?;
    info!(
        "Coinpilot {} starting, mode={:?}, trading_mode={}, tick={}ms",
        env!("CARGO_PKG_VERSION"),
        mode,
        config.trading_mode,
        config.orchestrator_tick_ms
    );

    let services = build_services(mode);
    let orchestrator = Arc::new(Orchestrator::new(config, services));

    if cli.once {
        orchestrator.tick().await;
        orchestrator.drain_worker_messages().await;
        info!("Single tick complete.");
        return Ok(());
    }

    orchestrator.start().await;
    info!("Orchestrator running. Press Ctrl+C to shut down.");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received.");
    orchestrator.stop().await;
    Ok(())
}
