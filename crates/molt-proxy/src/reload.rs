//! Reload trigger: SIGHUP handling and successor process spawning.
//!
//! A reload spawns a fresh copy of this executable with the inherit
//! marker set in its environment. The successor announces itself over
//! the reconfigure channel and the two processes run the handoff; the
//! predecessor exits once the successor confirms completion. Nothing is
//! inherited through fork besides stdio; sockets travel over the domain
//! channels.

use std::path::{Path, PathBuf};

use anyhow::Context;
use molt_core::channel::{ChannelEndpoint, ChannelPurpose};
use molt_core::config::HandoffConfig;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use crate::INHERIT_ENV;
use crate::coordinator::{HandoffReport, source};
use crate::engine::Engine;

/// Whether this process was started as the successor in a handoff.
#[must_use]
pub fn spawned_as_successor() -> bool {
    std::env::var_os(INHERIT_ENV).is_some()
}

/// Spawn the successor: same executable, same config, marked so it
/// announces a takeover instead of cold starting.
///
/// # Errors
///
/// Returns the spawn error.
pub fn spawn_successor(config_path: &Path) -> std::io::Result<u32> {
    let exe = std::env::current_exe()?;
    let child = std::process::Command::new(exe)
        .arg("--config")
        .arg(config_path)
        .env(INHERIT_ENV, "1")
        .spawn()?;
    let pid = child.id();
    info!(pid, "successor spawned");
    Ok(pid)
}

/// Serve until a reload hands everything off or a shutdown signal lands.
///
/// Returns `Ok(Some(report))` when a handoff completed and this process
/// should exit; `Ok(None)` on a shutdown signal. A failed reload leaves
/// this instance serving and the loop waiting for the next signal.
///
/// # Errors
///
/// Returns an error only if the signal handlers cannot be installed.
pub async fn serve_until_handoff(
    engine: &mut Engine,
    config: &HandoffConfig,
    config_path: &Path,
) -> anyhow::Result<Option<HandoffReport>> {
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("reload requested");
                match reload_once(engine, config, config_path).await {
                    Ok(report) => return Ok(Some(report)),
                    Err(e) => warn!(error = %e, "reload failed, still serving"),
                }
            },
            _ = sigterm.recv() => {
                info!("shutdown requested");
                return Ok(None);
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                return Ok(None);
            },
        }
    }
}

/// Session marker path: the file exists while a handoff is in flight.
///
/// A marker left behind with no handoff running means the process
/// crashed mid-handoff; that is what an operator checks first.
#[must_use]
pub fn marker_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("handoff.pid")
}

fn write_marker(runtime_dir: &Path) -> std::io::Result<PathBuf> {
    let path = marker_path(runtime_dir);
    std::fs::write(&path, format!("{}\n", std::process::id()))?;
    Ok(path)
}

/// One reload attempt: write the session marker and bind the reconfigure
/// channel before spawning, so the successor always finds the socket.
async fn reload_once(
    engine: &mut Engine,
    config: &HandoffConfig,
    config_path: &Path,
) -> anyhow::Result<HandoffReport> {
    let marker = write_marker(&config.handoff.runtime_dir).context("writing session marker")?;

    let result = async {
        let reconfig =
            ChannelEndpoint::bind(&config.handoff.runtime_dir, ChannelPurpose::ReconfigureAck)
                .context("binding reconfigure channel")?;
        spawn_successor(config_path).context("spawning successor")?;
        let report = source::run_source_on(reconfig, engine, config).await?;
        Ok(report)
    }
    .await;

    // Completed and aborted handoffs both end cleanly; only a crash
    // leaves the marker behind.
    if let Err(e) = std::fs::remove_file(&marker) {
        warn!(path = %marker.display(), error = %e, "failed to remove session marker");
    }
    result
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nix::sys::signal::{Signal, raise};
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_marker_records_this_process() {
        let dir = TempDir::new().unwrap();
        let path = write_marker(dir.path()).unwrap();
        assert_eq!(path, marker_path(dir.path()));

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim().parse::<u32>().unwrap(), std::process::id());
    }

    #[tokio::test]
    async fn test_failed_reload_removes_marker() {
        let dir = TempDir::new().unwrap();
        let mut config = HandoffConfig::default();
        config.handoff.runtime_dir = dir.path().to_path_buf();

        // Squat on the reconfigure socket path so the reload fails
        // before any successor is spawned.
        std::fs::create_dir(dir.path().join("reconfig.sock")).unwrap();

        let mut engine = Engine::new();
        let result = reload_once(&mut engine, &config, Path::new("molt.toml")).await;
        assert!(result.is_err());
        // The marker never outlives a finished attempt.
        assert!(!marker_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_back_to_back_triggers_collapse_to_one() {
        let mut sighup = signal(SignalKind::hangup()).unwrap();

        // Two triggers before the loop gets to poll, as an operator
        // double-firing a reload would produce.
        raise(Signal::SIGHUP).unwrap();
        raise(Signal::SIGHUP).unwrap();

        sighup.recv().await;
        // The second trigger collapsed into the first notification, so
        // the serial reload loop would start exactly one session.
        let second = tokio::time::timeout(Duration::from_millis(100), sighup.recv()).await;
        assert!(second.is_err());
    }
}
