//! Analysis job orchestrator process.
//!
//! Runs the commander, the worker pool or both, depending on the deployment
//! mode and role. Job specs are read as JSON lines from stdin.

use std::process::ExitCode;

use actors::{WorkerPool, start_worker_pool_with_cancel};
use commander::{Commander, Deployment, assemble};
use tracing::Level;

mod engines;
mod intake;
mod shutdown;

fn log_level() -> Result<Level, String> {
    let raw = std::env::var("DISPATCH_LOG_LEVEL").unwrap_or_default();
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "info" => Ok(Level::INFO),
        "debug" => Ok(Level::DEBUG),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "invalid DISPATCH_LOG_LEVEL '{raw}' (expected debug, info, warn, error)"
        )),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let level = match log_level() {
        Ok(level) => level,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let deployment = Deployment::from_env()?;
    tracing::info!(
        "Starting in {} mode ({:?}, {} workers)",
        deployment.mode,
        deployment.role,
        deployment.config.workers
    );

    let cancel = shutdown::install_shutdown_handler()?;
    let backends = assemble(&deployment).await?;
    let registry = engines::build_registry()?;
    let tools = registry.tools();
    tracing::info!("Engines: {}", tools.join(", "));

    let pool: Option<WorkerPool> = if deployment.role.runs_pool() {
        let pool = start_worker_pool_with_cancel(
            backends.clone(),
            registry,
            deployment.config.clone(),
            cancel.clone(),
        )
        .await?;
        spawn_event_log(&pool);
        Some(pool)
    } else {
        None
    };

    let intake = if deployment.role.runs_commander() {
        let mut commander = Commander::new(backends, tools, &deployment.config);
        if let Some(pool) = &pool {
            commander = commander.with_events(pool.events());
        }
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        Some(tokio::spawn(intake::run_intake(
            stdin,
            commander,
            deployment.config.poll_interval(),
            cancel.clone(),
        )))
    } else {
        None
    };

    cancel.cancelled().await;
    tracing::info!("Shutting down");

    if let Some(pool) = pool {
        pool.shutdown().await?;
    }
    if let Some(intake) = intake {
        match intake.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Intake failed: {}", e),
            Err(e) => tracing::warn!("Intake task failed: {}", e),
        }
    }
    tracing::info!("Stopped");
    Ok(())
}

fn spawn_event_log(pool: &WorkerPool) {
    let mut events = pool.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!("{}", event.description()),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Event log skipped {} events", skipped)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
