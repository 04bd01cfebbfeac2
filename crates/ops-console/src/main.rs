mod audit;
mod cli;
mod config;
mod http;
mod logging;
mod push;
mod render;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use ops_protocol::{ResourceType, ScopeKey};
use ops_tracker::{EventBus, OperationSession, OperationState, TrackerContext, TrackerError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{Args, Command};
use crate::config::{load_ops_config, OpsConfig};
use crate::http::{OperationRequest, PulseFetcher, PulseHttp, PulseTrigger};
use crate::logging::init_tracing;
use crate::push::{PushStream, StreamStatus};
use crate::render::{event_line, StatusPrinter};

const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    let _log_guard = init_tracing(args.log_dir.as_deref(), args.log_to_stderr)?;

    let config = load_ops_config(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    info!(
        config = %args.config.display(),
        base_url = %config.server.base_url,
        "pulse-ops starting"
    );
    let http = Arc::new(PulseHttp::new(&config).context("failed to build http client")?);
    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(shutdown.clone()));

    let code = match args.command {
        Command::Watch => watch_events(&config, shutdown.clone()).await?,
        Command::AuditResume {
            state,
            batch_size,
            yes,
        } => {
            let summary =
                audit::resume_verification(http, &state, batch_size, yes, shutdown.clone())
                    .await?;
            eprintln!(
                "verified={} failed={} error={} unchecked={} skipped_batches={}",
                summary.verified,
                summary.failed,
                summary.errors,
                summary.unchecked,
                summary.skipped_batches
            );
            ExitCode::SUCCESS
        }
        command => {
            let force_on_timeout = matches!(
                command,
                Command::StopAgent {
                    force_on_timeout: true,
                    ..
                }
            );
            let (scope, request) = operation_for(command)?;
            run_operation(
                &config,
                http,
                scope,
                request,
                force_on_timeout,
                shutdown.clone(),
            )
            .await?
        }
    };
    shutdown.cancel();
    Ok(code)
}

fn require(field: &str, value: String) -> anyhow::Result<String> {
    if value.trim().is_empty() {
        anyhow::bail!("{field} must not be empty");
    }
    Ok(value)
}

fn operation_for(command: Command) -> anyhow::Result<(ScopeKey, OperationRequest)> {
    let operation = match command {
        Command::Discover {
            resource_type,
            host,
            resource_id,
            force,
            hostname,
        } => (
            ScopeKey::new(
                ResourceType::from(require("resource type", resource_type)?.as_str()),
                require("host", host)?,
                require("resource id", resource_id)?,
            ),
            OperationRequest::Discovery { force, hostname },
        ),
        Command::StopAgent { host, .. } => {
            (ScopeKey::agent(require("host", host)?), OperationRequest::StopAgent)
        }
        Command::UpdateContainer {
            host,
            container,
            name,
        } => (
            ScopeKey::new(
                ResourceType::Docker,
                require("host", host)?,
                require("container", container)?,
            ),
            OperationRequest::UpdateContainer {
                container_name: name,
            },
        ),
        Command::UpdateAll { host } => {
            (ScopeKey::agent(require("host", host)?), OperationRequest::UpdateAll)
        }
        Command::CheckUpdates { host } => {
            (ScopeKey::agent(require("host", host)?), OperationRequest::CheckUpdates)
        }
        Command::Watch | Command::AuditResume { .. } => {
            anyhow::bail!("command does not start an operation")
        }
    };
    Ok(operation)
}

/// Starts the push feed and gives it a moment to connect so early progress
/// events are not missed.
async fn connect_push(
    config: &OpsConfig,
    bus: &EventBus,
    shutdown: &CancellationToken,
) -> anyhow::Result<watch::Receiver<StreamStatus>> {
    let ws_url = config.server.ws_url()?;
    let mut status = PushStream::new(ws_url.clone(), config.server.api_token.clone(), bus.clone())
        .spawn(shutdown.child_token())
        .with_context(|| format!("invalid push url {ws_url}"))?;

    let connected = matches!(
        tokio::time::timeout(
            config.connect_timeout().max(Duration::from_secs(1)),
            status.wait_for(|status| *status == StreamStatus::Connected),
        )
        .await,
        Ok(Ok(_))
    );
    if !connected {
        warn!(url = %ws_url, "push stream not connected yet, progress may arrive late");
    }
    Ok(status)
}

async fn run_operation(
    config: &OpsConfig,
    http: Arc<PulseHttp>,
    scope: ScopeKey,
    request: OperationRequest,
    force_on_timeout: bool,
    shutdown: CancellationToken,
) -> anyhow::Result<ExitCode> {
    let kind = request.kind();
    let fetcher = Arc::new(PulseFetcher::new(http.clone(), kind));
    let ctx = TrackerContext::new(fetcher, config.tracker_config()?);
    let _stream_status = connect_push(config, &ctx.bus, &shutdown).await?;

    let trigger = Arc::new(PulseTrigger::new(http, request));
    let mut session = OperationSession::start(ctx, scope.clone(), kind, trigger)
        .with_context(|| format!("failed to start {kind:?} for {scope}"))?;
    let mut view = session.watch();
    let mut printer = StatusPrinter::default();

    loop {
        let current = view.borrow_and_update().clone();
        printer.print(&scope, &current);
        if current.is_settled() {
            break;
        }
        if force_on_timeout && current.timed_out {
            match session.force_resolve().await {
                Ok(()) => continue,
                Err(TrackerError::AlreadyResolved(_)) => {}
                Err(err) => warn!(scope = %scope, error = %err, "override not applied"),
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => {
                session.cancel();
                eprintln!("[{scope}] cancelled");
                return Ok(ExitCode::from(EXIT_INTERRUPTED));
            }
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    let result = session.view();
    if let Some(banner) = result.error_banner.as_deref() {
        eprintln!("{banner}");
    }
    if let Some(data) = result.data.as_ref() {
        println!("{}", serde_json::to_string_pretty(data)?);
    }
    session.close();
    Ok(match result.state {
        OperationState::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

async fn watch_events(config: &OpsConfig, shutdown: CancellationToken) -> anyhow::Result<ExitCode> {
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let _stream_status = connect_push(config, &bus, &shutdown).await?;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => println!("{}", event_line(&event)),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "watch output lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_update_scopes_to_container() {
        let (scope, request) = operation_for(Command::UpdateContainer {
            host: "dock-1".to_string(),
            container: "abc123".to_string(),
            name: Some("web".to_string()),
        })
        .expect("operation");
        assert_eq!(scope.to_string(), "docker:dock-1:abc123");
        assert_eq!(request.kind(), ops_tracker::OperationKind::UpdateContainer);
    }

    #[test]
    fn host_commands_scope_to_agent() {
        let (scope, _) = operation_for(Command::CheckUpdates {
            host: "dock-1".to_string(),
        })
        .expect("operation");
        assert_eq!(scope, ScopeKey::agent("dock-1"));
    }

    #[test]
    fn rejects_blank_identifiers() {
        assert!(operation_for(Command::UpdateAll {
            host: " ".to_string()
        })
        .is_err());
        assert!(operation_for(Command::Watch).is_err());
    }
}
