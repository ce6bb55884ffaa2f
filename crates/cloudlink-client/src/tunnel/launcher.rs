//! Tunnel process launching

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::binary::BinaryInstaller;
use super::log_parser::parse_quick_tunnel_url;
use crate::error::{ReachError, Result};

const LOG_CHANNEL_CAPACITY: usize = 256;

/// How the tunnel is run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMode {
    /// Pre-provisioned tunnel identified by a token
    Named { token: String },
    /// Ephemeral tunnel in front of a local URL
    Quick { local_url: String },
}

impl TunnelMode {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["tunnel".to_string(), "--no-autoupdate".to_string()];
        match self {
            Self::Named { token } => {
                args.extend(["run".to_string(), "--token".to_string(), token.clone()]);
            }
            Self::Quick { local_url } => {
                // The local certificate is self-signed
                args.extend([
                    "--url".to_string(),
                    local_url.clone(),
                    "--no-tls-verify".to_string(),
                ]);
            }
        }
        args
    }
}

/// Handles to a running tunnel process. Dropping it kills the process.
pub struct LaunchedTunnel {
    /// Every line the process writes to stderr
    pub log_lines: mpsc::Receiver<String>,
    /// Resolves with the public URL when the process announces one
    pub url: oneshot::Receiver<String>,
    /// Resolves with a description of how the process ended
    pub exit: oneshot::Receiver<String>,
    pub kill: oneshot::Sender<()>,
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, mode: &TunnelMode) -> Result<LaunchedTunnel>;
}

/// Runs the real tunnel binary
pub struct CommandLauncher {
    installer: Arc<BinaryInstaller>,
}

impl CommandLauncher {
    pub fn new(installer: Arc<BinaryInstaller>) -> Self {
        Self { installer }
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, mode: &TunnelMode) -> Result<LaunchedTunnel> {
        let binary = self.installer.ensure_installed().await?;

        let mut child = Command::new(&binary)
            .args(mode.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ReachError::TunnelProcess(format!("failed to start {}: {}", binary.display(), e))
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ReachError::TunnelProcess("stderr not captured".to_string()))?;

        let (line_tx, line_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let (url_tx, url_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut url_tx = Some(url_tx);
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "cloudlink::tunnel", "{}", line);
                if let Some(url) = parse_quick_tunnel_url(&line) {
                    if let Some(tx) = url_tx.take() {
                        let _ = tx.send(url);
                    }
                }
                // Keep draining stderr even if nobody listens anymore
                let _ = line_tx.send(line).await;
            }
        });

        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.to_string(),
                    Err(e) => format!("wait failed: {}", e),
                },
                _ = kill_rx => {
                    let _ = child.kill().await;
                    "killed".to_string()
                }
            };
            let _ = exit_tx.send(outcome);
        });

        Ok(LaunchedTunnel {
            log_lines: line_rx,
            url: url_rx,
            exit: exit_rx,
            kill: kill_tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_tunnel_args() {
        let mode = TunnelMode::Named {
            token: "abc".to_string(),
        };
        assert_eq!(
            mode.args(),
            vec!["tunnel", "--no-autoupdate", "run", "--token", "abc"]
        );
    }

    #[test]
    fn test_quick_tunnel_args() {
        let mode = TunnelMode::Quick {
            local_url: "https://localhost:10443".to_string(),
        };
        assert_eq!(
            mode.args(),
            vec![
                "tunnel",
                "--no-autoupdate",
                "--url",
                "https://localhost:10443",
                "--no-tls-verify"
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_launcher_reports_lines_and_exit() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-tunnel");
        std::fs::write(
            &script,
            "#!/bin/sh\necho 'INF |  https://quiet-river.trycloudflare.com  |' >&2\necho done >&2\nexit 3\n",
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let installer = BinaryInstaller::new(dir.path())
            .unwrap()
            .with_override(Some(script));
        let launcher = CommandLauncher::new(Arc::new(installer));

        let mut tunnel = launcher
            .launch(&TunnelMode::Quick {
                local_url: "https://localhost:1".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(
            tunnel.url.await.unwrap(),
            "https://quiet-river.trycloudflare.com"
        );
        assert!(tunnel.log_lines.recv().await.unwrap().contains("trycloudflare"));
        assert_eq!(tunnel.log_lines.recv().await.unwrap(), "done");
        assert!(tunnel.exit.await.unwrap().contains('3'));
    }
}
