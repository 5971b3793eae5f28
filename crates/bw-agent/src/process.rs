//! Sidecar process supervision.
//!
//! The session-hosting process is an external binary exposing the HTTP
//! surface the adapter consumes. We own its lifecycle: spawn, bounded
//! readiness polling, a periodic background liveness probe, and shutdown.

use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{info, warn};

use bw_core::config::RuntimeConfig;
use bw_core::errors::EngineError;

/// A supervised sidecar process.
#[derive(Debug)]
pub struct SidecarProcess {
    child: Option<Child>,
    base_url: String,
    client: reqwest::Client,
    startup_timeout: Duration,
    startup_poll_interval: Duration,
}

impl SidecarProcess {
    /// Spawn the sidecar binary. The process is killed when this handle is
    /// dropped; `stop` shuts it down explicitly.
    pub fn spawn(config: &RuntimeConfig) -> Result<Self, EngineError> {
        let child = Command::new(&config.sidecar_command)
            .arg("--port")
            .arg(config.sidecar_port.to_string())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::ProcessSpawn(e.to_string()))?;

        info!(
            command = %config.sidecar_command.display(),
            port = config.sidecar_port,
            "Sidecar spawned"
        );

        Ok(Self {
            child: Some(child),
            base_url: config.sidecar_base_url(),
            client: reqwest::Client::new(),
            startup_timeout: config.startup_timeout,
            startup_poll_interval: config.startup_poll_interval,
        })
    }

    /// Attach to an already-running sidecar without owning a child process.
    pub fn attach(config: &RuntimeConfig) -> Self {
        Self {
            child: None,
            base_url: config.sidecar_base_url(),
            client: reqwest::Client::new(),
            startup_timeout: config.startup_timeout,
            startup_poll_interval: config.startup_poll_interval,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Poll `/health` until it answers 200, bounded by the startup timeout.
    /// Never becoming ready is fatal: no session work can proceed.
    pub async fn wait_ready(&self) -> Result<(), EngineError> {
        wait_ready(
            &self.client,
            &self.base_url,
            self.startup_timeout,
            self.startup_poll_interval,
        )
        .await
    }

    /// Periodic background liveness probe. Failures are logged, not fatal:
    /// a transient network hiccup must not kill an active session.
    pub fn spawn_liveness_probe(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let url = format!("{}/health", self.base_url);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                match client.get(&url).send().await {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => {
                        warn!(status = %resp.status(), "Sidecar liveness probe failed");
                    }
                    Err(e) => {
                        warn!(error = %e, "Sidecar liveness probe unreachable");
                    }
                }
            }
        })
    }

    /// Stop the sidecar process if we own one.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill sidecar");
            } else {
                info!("Sidecar stopped");
            }
        }
    }
}

/// Readiness polling, separated from the process handle for testability.
pub async fn wait_ready(
    client: &reqwest::Client,
    base_url: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), EngineError> {
    let url = format!("{base_url}/health");
    let poll = async {
        loop {
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => {
                    warn!(status = %resp.status(), "Sidecar not ready yet");
                }
                Err(_) => {}
            }
            tokio::time::sleep(poll_interval).await;
        }
    };

    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| EngineError::ServerStartupTimeout {
            timeout_secs: timeout.as_secs(),
        })?;

    info!(url = %url, "Sidecar ready");
    Ok(())
}
