use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stress_scheduler::scenarios::register_builtin;
use stress_scheduler::{
    HistogramMetrics, RequestExecutor, ScenarioContext, ScenarioRegistry, StressPlan,
    StressScheduler,
};
use tokio::time::sleep;
use tracing::{info, warn};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "stress-scheduler")]
#[command(about = "Stage-based stress test runner", long_about = None)]
struct Config {
    /// Stress plan JSON file
    #[arg(long, env = "STRESS_PLAN", default_value = "stress-plan.json")]
    plan: PathBuf,

    /// Seconds a scenario provider may take to initialize
    #[arg(long, env = "PROVIDER_TIMEOUT", default_value = "10")]
    provider_timeout: u64,

    /// Seconds to wait for running scenarios after Ctrl-C
    #[arg(long, env = "SHUTDOWN_GRACE", default_value = "30")]
    shutdown_grace: u64,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    let plan = StressPlan::load_from_file(&config.plan)
        .with_context(|| format!("Failed to load stress plan: {:?}", config.plan))?;

    // Print banner
    info!("════════════════════════════════════════════════════════════");
    info!("                 STRESS SCHEDULER");
    info!("════════════════════════════════════════════════════════════");
    info!(
        "Target: {}://{}:{}",
        if plan.globals.use_ssl { "wss" } else { "ws" },
        plan.globals.host,
        plan.globals.port
    );
    for stage in &plan.stages {
        info!(
            "Stage {}: {} at {}/s, delay {:?}, duration {:?}, {} actions",
            stage.name,
            stage.scenario_kind,
            stage.rate.base_rate,
            stage.start_delay,
            stage.active_window,
            stage.actions.len()
        );
    }
    info!("════════════════════════════════════════════════════════════");

    let mut registry = ScenarioRegistry::new();
    register_builtin(&mut registry);

    let metrics = Arc::new(HistogramMetrics::new());
    let executor = Arc::new(RequestExecutor::new(&plan.globals).context("Invalid target")?);
    let context = ScenarioContext::new(metrics.clone(), executor, Arc::new(plan));

    let scheduler = Arc::new(
        StressScheduler::new(Arc::new(registry), context)
            .with_provider_timeout(Duration::from_secs(config.provider_timeout)),
    );

    let run = scheduler.run();
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result.context("Stress run failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, stopping");
            scheduler.stop();

            // Wait for graceful shutdown
            info!("Waiting for graceful shutdown (max {}s)", config.shutdown_grace);
            tokio::select! {
                _ = sleep(Duration::from_secs(config.shutdown_grace)) => {
                    warn!("Graceful shutdown timeout reached");
                }
                result = &mut run => {
                    result.context("Stress run failed")?;
                    info!("All scenarios stopped before timeout");
                }
            }
        }
    }

    // Print summary
    metrics.print_summary();

    info!("════════════════════════════════════════════════════════════");
    info!("                 STRESS RUN COMPLETE");
    info!("════════════════════════════════════════════════════════════");

    Ok(())
}
