//! Tunnel process supervision
//!
//! `Idle -> Starting -> Running -> Backoff(n) -> Starting ...` for as long
//! as the tunnel is enabled. Backoff wraps the whole start and discovery
//! step: a failed start, an exit before the process is ready and an exit
//! shortly after it came up all wait for the next delay. Only a process that
//! stayed up for the stable period restarts at once with a fresh sequence.

use futures::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use super::backoff::{Backoff, BackoffConfig};
use super::launcher::{LaunchedTunnel, ProcessLauncher, TunnelMode};
use super::log_parser::parse_tunnel_log;
use crate::error::{ReachError, Result};
use crate::shutdown::ShutdownSignal;

/// How long a started process may stay silent about its hostname before it
/// is considered running without one
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running { hostname: Option<String> },
    Backoff { attempt: u32, delay: Duration },
}

struct RunningTunnel {
    log_lines: mpsc::Receiver<String>,
    exit: oneshot::Receiver<String>,
    // Held so the process lives as long as the session
    _kill: oneshot::Sender<()>,
    hostname: Option<String>,
}

pub struct TunnelSupervisor {
    launcher: Arc<dyn ProcessLauncher>,
    backoff: BackoffConfig,
    discovery_timeout: Duration,
    state_tx: watch::Sender<SupervisorState>,
    hostname_tx: watch::Sender<Option<String>>,
}

impl TunnelSupervisor {
    pub fn new(launcher: Arc<dyn ProcessLauncher>) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Idle);
        let (hostname_tx, _) = watch::channel(None);
        Self {
            launcher,
            backoff: BackoffConfig::default(),
            discovery_timeout: DISCOVERY_TIMEOUT,
            state_tx,
            hostname_tx,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    /// Public tunnel URL (`https://host`), `None` while unavailable
    pub fn hostname(&self) -> watch::Receiver<Option<String>> {
        self.hostname_tx.subscribe()
    }

    /// Supervise the tunnel until shutdown
    pub async fn run(&self, mode: TunnelMode, mut shutdown: ShutdownSignal) {
        let mut backoff = Backoff::new(self.backoff.clone());

        while !shutdown.is_triggered() {
            self.state_tx.send_replace(SupervisorState::Starting);

            let started = tokio::select! {
                started = self.start(&mode) => started,
                _ = shutdown.triggered() => break,
            };

            let failure = match started {
                Ok(session) => {
                    match &session.hostname {
                        Some(hostname) => info!("Tunnel running at {}", hostname),
                        None => info!("Tunnel running; public hostname unavailable"),
                    }
                    self.set_running(session.hostname.clone());

                    let up_since = Instant::now();
                    let exit = tokio::select! {
                        exit = self.monitor(session) => exit,
                        _ = shutdown.triggered() => break,
                    };
                    self.publish_hostname(None);

                    let uptime = up_since.elapsed();
                    if uptime >= self.backoff.max_backoff {
                        warn!("Tunnel process exited ({}); restarting", exit);
                        backoff.reset();
                        continue;
                    }
                    format!("process exited after {}s ({})", uptime.as_secs(), exit)
                }
                Err(e) => {
                    self.publish_hostname(None);
                    e.to_string()
                }
            };

            let delay = backoff.next_delay();
            let attempt = backoff.attempt();
            warn!(
                attempt,
                "Tunnel failed: {}. Retrying in {}s",
                failure,
                delay.as_secs()
            );
            self.state_tx
                .send_replace(SupervisorState::Backoff { attempt, delay });

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.triggered() => break,
            }
        }

        self.publish_hostname(None);
        self.state_tx.send_replace(SupervisorState::Idle);
        info!("Tunnel supervisor stopped");
    }

    /// Launch and race hostname discovery from the logs against the
    /// process's own URL signal and its exit
    async fn start(&self, mode: &TunnelMode) -> Result<RunningTunnel> {
        let LaunchedTunnel {
            mut log_lines,
            mut url,
            mut exit,
            kill,
        } = self.launcher.launch(mode).await?;

        let from_logs = async {
            while let Some(line) = log_lines.recv().await {
                if let Some(hostname) = parse_tunnel_log(&line) {
                    return hostname;
                }
            }
            pending().await
        };
        let from_signal = async {
            match (&mut url).await {
                Ok(url) => url,
                Err(_) => pending().await,
            }
        };

        let hostname = tokio::select! {
            hostname = from_logs => Some(hostname),
            url = from_signal => Some(url),
            _ = sleep(self.discovery_timeout) => None,
            status = &mut exit => {
                let status = status.unwrap_or_else(|_| "unknown status".to_string());
                return Err(ReachError::TunnelProcess(format!(
                    "process exited before it was ready ({})",
                    status
                )));
            }
        };

        Ok(RunningTunnel {
            log_lines,
            exit,
            _kill: kill,
            hostname,
        })
    }

    /// Follow a running session until its process exits. Later config
    /// lines update the published hostname.
    async fn monitor(&self, mut session: RunningTunnel) -> String {
        loop {
            tokio::select! {
                status = &mut session.exit => {
                    return status.unwrap_or_else(|_| "unknown status".to_string());
                }
                line = session.log_lines.recv() => match line {
                    Some(line) => {
                        if let Some(hostname) = parse_tunnel_log(&line) {
                            if session.hostname.as_deref() != Some(hostname.as_str()) {
                                info!("Tunnel hostname changed to {}", hostname);
                                session.hostname = Some(hostname.clone());
                                self.set_running(Some(hostname));
                            }
                        }
                    }
                    None => {
                        return (&mut session.exit)
                            .await
                            .unwrap_or_else(|_| "unknown status".to_string());
                    }
                },
            }
        }
    }

    fn set_running(&self, hostname: Option<String>) {
        self.publish_hostname(hostname.clone());
        self.state_tx
            .send_replace(SupervisorState::Running { hostname });
    }

    fn publish_hostname(&self, hostname: Option<String>) {
        self.hostname_tx.send_if_modified(|current| {
            if *current == hostname {
                return false;
            }
            *current = hostname;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::shutdown_channel;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    const CONFIG_LINE: &str = r#"INF Updated to new configuration config="{\"ingress\":[{\"hostname\":\"x.example.com\"}]}" version=1"#;

    enum Script {
        /// Launch itself fails
        FailLaunch,
        /// Process exits before reporting anything
        ExitBeforeReady,
        /// Logs the given line, then runs for the given time
        Log(&'static str, Duration),
        /// Announces the URL, then runs for the given time
        Url(&'static str, Duration),
        /// Says nothing and runs until killed
        Silent,
    }

    struct FakeLauncher {
        scripts: Mutex<VecDeque<Script>>,
        launches: mpsc::UnboundedSender<Instant>,
    }

    impl FakeLauncher {
        fn new(scripts: Vec<Script>) -> (Arc<Self>, mpsc::UnboundedReceiver<Instant>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let launcher = Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                launches: tx,
            });
            (launcher, rx)
        }
    }

    #[async_trait]
    impl ProcessLauncher for FakeLauncher {
        async fn launch(&self, _mode: &TunnelMode) -> Result<LaunchedTunnel> {
            let _ = self.launches.send(Instant::now());
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Script::FailLaunch);

            let (line_tx, line_rx) = mpsc::channel(16);
            let (url_tx, url_rx) = oneshot::channel();
            let (exit_tx, exit_rx) = oneshot::channel();
            let mut exit_tx = Some(exit_tx);
            let (kill_tx, kill_rx) = oneshot::channel::<()>();

            let run_for = match script {
                Script::FailLaunch => {
                    return Err(ReachError::TunnelProcess("binary missing".to_string()))
                }
                Script::ExitBeforeReady => {
                    if let Some(exit_tx) = exit_tx.take() {
                        let _ = exit_tx.send("exit status: 1".to_string());
                    }
                    None
                }
                Script::Log(line, run_for) => {
                    let _ = line_tx.send(line.to_string()).await;
                    Some(Some(run_for))
                }
                Script::Url(url, run_for) => {
                    let _ = url_tx.send(url.to_string());
                    Some(Some(run_for))
                }
                Script::Silent => Some(None),
            };

            if let (Some(run_for), Some(exit_tx)) = (run_for, exit_tx.take()) {
                tokio::spawn(async move {
                    let _line_tx = line_tx;
                    let ran = async {
                        match run_for {
                            Some(d) => sleep(d).await,
                            None => pending::<()>().await,
                        }
                    };
                    tokio::select! {
                        _ = ran => { let _ = exit_tx.send("exit status: 0".to_string()); }
                        _ = kill_rx => {}
                    }
                });
            }

            Ok(LaunchedTunnel {
                log_lines: line_rx,
                url: url_rx,
                exit: exit_rx,
                kill: kill_tx,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_loop_backs_off() {
        let (launcher, mut launches) = FakeLauncher::new(vec![
            Script::ExitBeforeReady,
            Script::ExitBeforeReady,
            Script::ExitBeforeReady,
            Script::ExitBeforeReady,
        ]);
        let supervisor = Arc::new(TunnelSupervisor::new(launcher));
        let (trigger, signal) = shutdown_channel();

        let task = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                supervisor
                    .run(
                        TunnelMode::Quick {
                            local_url: "https://localhost:1".to_string(),
                        },
                        signal,
                    )
                    .await
            })
        };

        let mut times = Vec::new();
        for _ in 0..5 {
            times.push(launches.recv().await.unwrap());
        }
        let delays: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();

        assert_eq!(delays[0], Duration::from_secs(60));
        assert_eq!(delays[1], Duration::from_secs(72));
        for pair in delays.windows(2) {
            assert!(pair[1].as_secs_f64() >= pair[0].as_secs_f64() * 1.2 - 0.001);
        }
        assert!(matches!(
            *supervisor.state().borrow(),
            SupervisorState::Backoff { .. } | SupervisorState::Starting
        ));

        trigger.trigger();
        task.await.unwrap();
        assert_eq!(*supervisor.state().borrow(), SupervisorState::Idle);
    }

    fn spawn_run(
        supervisor: &Arc<TunnelSupervisor>,
        signal: ShutdownSignal,
    ) -> tokio::task::JoinHandle<()> {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            supervisor
                .run(
                    TunnelMode::Named {
                        token: "t".to_string(),
                    },
                    signal,
                )
                .await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_after_start_backs_off() {
        let (launcher, mut launches) = FakeLauncher::new(
            (0..6)
                .map(|_| Script::Log(CONFIG_LINE, Duration::from_secs(1)))
                .collect(),
        );
        let supervisor = Arc::new(TunnelSupervisor::new(launcher));
        let (trigger, signal) = shutdown_channel();
        let task = spawn_run(&supervisor, signal);

        let mut times = Vec::new();
        for _ in 0..5 {
            times.push(launches.recv().await.unwrap());
        }
        // Each process runs one second before the restart delay starts
        let delays: Vec<Duration> = times
            .windows(2)
            .map(|w| w[1] - w[0] - Duration::from_secs(1))
            .collect();

        assert_eq!(delays[0], Duration::from_secs(60));
        assert_eq!(delays[1], Duration::from_secs(72));
        for pair in delays.windows(2) {
            assert!(pair[1].as_secs_f64() >= pair[0].as_secs_f64() * 1.2 - 0.001);
        }

        trigger.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hostname_from_logs_cleared_on_exit() {
        let (launcher, mut launches) = FakeLauncher::new(vec![
            Script::Log(CONFIG_LINE, Duration::from_secs(10)),
            Script::Silent,
        ]);
        let supervisor = Arc::new(
            TunnelSupervisor::new(launcher).with_discovery_timeout(Duration::from_secs(5)),
        );
        let mut hostname = supervisor.hostname();
        let (trigger, signal) = shutdown_channel();
        let task = spawn_run(&supervisor, signal);

        let first = launches.recv().await.unwrap();
        hostname.wait_for(|h| h.is_some()).await.unwrap();
        assert_eq!(
            hostname.borrow().as_deref(),
            Some("https://x.example.com")
        );

        hostname.wait_for(|h| h.is_none()).await.unwrap();
        let second = launches.recv().await.unwrap();
        assert_eq!(second - first, Duration::from_secs(10 + 60));

        // The silent process is running without a hostname
        let mut state = supervisor.state();
        state
            .wait_for(|s| *s == SupervisorState::Running { hostname: None })
            .await
            .unwrap();
        assert_eq!(*hostname.borrow(), None);

        trigger.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_process_restarts_at_once() {
        let (launcher, mut launches) = FakeLauncher::new(vec![
            Script::ExitBeforeReady,
            Script::Log(CONFIG_LINE, Duration::from_secs(400)),
            Script::ExitBeforeReady,
            Script::Silent,
        ]);
        let supervisor = Arc::new(TunnelSupervisor::new(launcher));
        let (trigger, signal) = shutdown_channel();
        let task = spawn_run(&supervisor, signal);

        let t0 = launches.recv().await.unwrap();
        let t1 = launches.recv().await.unwrap();
        assert_eq!(t1 - t0, Duration::from_secs(60));

        // Up longer than the stable period: immediate restart
        let t2 = launches.recv().await.unwrap();
        assert_eq!(t2 - t1, Duration::from_secs(400));

        // The sequence started over
        let t3 = launches.recv().await.unwrap();
        assert_eq!(t3 - t2, Duration::from_secs(60));

        trigger.trigger();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_url_signal_resolves_hostname() {
        let (launcher, _launches) = FakeLauncher::new(vec![Script::Url(
            "https://quiet-river.trycloudflare.com",
            Duration::from_secs(3600),
        )]);
        let supervisor = Arc::new(TunnelSupervisor::new(launcher));
        let mut hostname = supervisor.hostname();
        let (trigger, signal) = shutdown_channel();

        let task = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                supervisor
                    .run(
                        TunnelMode::Quick {
                            local_url: "https://localhost:1".to_string(),
                        },
                        signal,
                    )
                    .await
            })
        };

        hostname.wait_for(|h| h.is_some()).await.unwrap();
        assert_eq!(
            *supervisor.state().borrow(),
            SupervisorState::Running {
                hostname: Some("https://quiet-river.trycloudflare.com".to_string())
            }
        );

        trigger.trigger();
        task.await.unwrap();
        assert_eq!(*supervisor.hostname().borrow(), None);
    }
}
