mod cli;
mod config;
mod fanout;
mod logging;
mod media;
mod peer;
mod signaling;
mod sink;
mod source;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::fanout::FanOut;
use crate::media::MediaFactory;
use crate::sink::SinkEndpoint;
use crate::source::SourceEndpoint;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args()?;

    let config_path = args
        .config_path
        .as_deref()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from(config::DEFAULT_CONFIG_PATH));
    // `load_config` runs before the subscriber exists, so it hands back its
    // log lines instead of emitting them directly — emitting them now would
    // be silently dropped.
    let (mut relay_config, config_notes) = config::load_config(&config_path)?;
    cli::apply(&args, &mut relay_config);

    let _logging_guard = logging::init(&relay_config.log_level, relay_config.log_file.as_deref());

    for note in config_notes {
        match note.level {
            tracing::Level::ERROR => tracing::error!("{}", note.message),
            tracing::Level::WARN => tracing::warn!("{}", note.message),
            _ => tracing::info!("{}", note.message),
        }
    }

    if let Err(issues) = relay_config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    tracing::info!(
        source_port = relay_config.source_port,
        sink_port = relay_config.sink_port,
        "starting screenshare relay"
    );

    // One media engine shared by every peer connection the process creates.
    let factory = Arc::new(MediaFactory::new(relay_config.ice.clone())?);
    let fanout = Arc::new(FanOut::new());

    let source_addr: SocketAddr = format!("0.0.0.0:{}", relay_config.source_port)
        .parse()
        .context("invalid source bind address")?;
    let sink_addr: SocketAddr = format!("0.0.0.0:{}", relay_config.sink_port)
        .parse()
        .context("invalid sink bind address")?;

    let source_endpoint = SourceEndpoint::new(Arc::clone(&factory), Arc::clone(&fanout));
    let sink_endpoint = SinkEndpoint::new(Arc::clone(&factory), Arc::clone(&fanout));

    let source_for_listener = Arc::clone(&source_endpoint);
    let sink_for_listener = Arc::clone(&sink_endpoint);
    let source_task = tokio::spawn(async move { source_for_listener.run(source_addr).await });
    let sink_task = tokio::spawn(async move { sink_for_listener.run(sink_addr).await });

    wait_for_shutdown_signal().await?;
    tracing::info!("shutting down");

    // Stop accepting new connections, then join the listener tasks — they
    // only drive the accept loop, so aborting and joining them is safe
    // without touching any connection already handed off to its own task.
    source_task.abort();
    sink_task.abort();
    let _ = source_task.await;
    let _ = sink_task.await;

    // Close every sink socket with "going away", then the source socket,
    // releasing each connection's peer connection as its task unwinds.
    sink_endpoint.shutdown().await;
    source_endpoint.shutdown().await;

    tracing::info!("shutdown complete");
    Ok(())
}

/// Resolves once any of: a "exit" line (or EOF) on stdin, Ctrl-C, or SIGTERM
/// is observed.
async fn wait_for_shutdown_signal() -> Result<()> {
    let (stdin_tx, stdin_rx) = tokio::sync::oneshot::channel::<&'static str>();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line == "exit" {
                        let _ = stdin_tx.send("received \"exit\" on stdin");
                        return;
                    }
                }
                Ok(None) => {
                    let _ = stdin_tx.send("stdin closed (EOF)");
                    return;
                }
                Err(_) => return,
            }
        }
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    tokio::select! {
        reason = stdin_rx => {
            tracing::info!(reason = reason.unwrap_or("stdin watcher dropped"), "shutdown requested");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl-C, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}
