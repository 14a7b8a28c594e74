use super::locator::{ProcessLocator, SystemProcessLocator};
use crate::error::Result;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{info, warn};

/// What `reclaim` found and did for one port.
#[derive(Debug, Clone, PartialEq)]
pub enum ReclaimOutcome {
    AlreadyFree,
    Freed { pids: Vec<u32> },
    /// Termination was attempted but the listeners outlived the grace window.
    StillHeld { pids: Vec<u32> },
    /// Listeners could not be enumerated.
    Unverified { reason: String },
}

impl ReclaimOutcome {
    pub fn is_free(&self) -> bool {
        matches!(self, Self::AlreadyFree | Self::Freed { .. })
    }
}

pub struct PortReclaimer<L: ProcessLocator = SystemProcessLocator> {
    locator: L,
    grace: Duration,
    check_interval: Duration,
}

impl PortReclaimer<SystemProcessLocator> {
    pub fn new(grace: Duration) -> Self {
        Self::with_locator(SystemProcessLocator, grace)
    }
}

impl<L: ProcessLocator> PortReclaimer<L> {
    pub fn with_locator(locator: L, grace: Duration) -> Self {
        Self {
            locator,
            grace,
            check_interval: Duration::from_millis(100),
        }
    }

    /// Terminate whatever is listening on `port`. Never fails the caller:
    /// anything short of a freed port is reported through the outcome.
    pub async fn reclaim(&self, port: u16) -> ReclaimOutcome {
        let own_pid = std::process::id();
        let pids = match self.listeners(port, own_pid).await {
            Ok(pids) => pids,
            Err(e) => {
                warn!(port, error = %e, "could not enumerate listeners");
                return ReclaimOutcome::Unverified { reason: e.to_string() };
            }
        };

        if pids.is_empty() {
            info!(port, "port already free");
            return ReclaimOutcome::AlreadyFree;
        }

        for pid in &pids {
            info!(port, pid, "terminating listener");
            if let Err(e) = self.locator.terminate(*pid, false).await {
                warn!(port, pid, error = %e, "SIGTERM failed");
            }
        }

        if self.wait_until_free(port, own_pid, self.grace).await {
            info!(port, ?pids, "port reclaimed");
            return ReclaimOutcome::Freed { pids };
        }

        // Same escalation as a `kill -9` after the grace window.
        let stubborn = self.listeners(port, own_pid).await.unwrap_or_else(|_| pids.clone());
        for pid in &stubborn {
            warn!(port, pid, "listener ignored SIGTERM, sending SIGKILL");
            if let Err(e) = self.locator.terminate(*pid, true).await {
                warn!(port, pid, error = %e, "SIGKILL failed");
            }
        }

        if self.wait_until_free(port, own_pid, Duration::from_millis(500)).await {
            info!(port, ?pids, "port reclaimed after SIGKILL");
            return ReclaimOutcome::Freed { pids };
        }

        let remaining = self.listeners(port, own_pid).await.unwrap_or(stubborn);
        warn!(port, pids = ?remaining, "port still held after grace period");
        ReclaimOutcome::StillHeld { pids: remaining }
    }

    async fn listeners(&self, port: u16, own_pid: u32) -> Result<Vec<u32>> {
        let mut pids = self.locator.listening_pids(port).await?;
        pids.retain(|pid| *pid != own_pid);
        Ok(pids)
    }

    async fn wait_until_free(&self, port: u16, own_pid: u32, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        loop {
            match self.listeners(port, own_pid).await {
                Ok(pids) if pids.is_empty() => return true,
                _ => {}
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.check_interval).await;
        }
    }
}

/// True when nothing is bound to `host:port`.
pub async fn is_port_free(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).await.is_ok()
}
