// ICMP reachability through the system ping binary

use async_trait::async_trait;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait Reachability: Send + Sync {
    /// True when `addr` answers, optionally pinging from source address `bind`.
    async fn reachable(&self, addr: IpAddr, bind: Option<IpAddr>) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemPing {
    pub count: u32,
    pub timeout: Duration,
}

impl SystemPing {
    pub fn new(count: u32, timeout: Duration) -> Self {
        Self { count: count.max(1), timeout }
    }

    fn deadline(&self) -> Duration {
        self.timeout * self.count + Duration::from_secs(1)
    }

    fn command(&self, addr: IpAddr, bind: Option<IpAddr>) -> Command {
        let mut cmd = Command::new("ping");
        cmd.arg("-n")
            .arg("-c")
            .arg(self.count.to_string())
            .arg("-W")
            .arg(self.timeout.as_secs().max(1).to_string());
        if let Some(b) = bind {
            cmd.arg("-I").arg(b.to_string());
        }
        cmd.arg(addr.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Reachability for SystemPing {
    async fn reachable(&self, addr: IpAddr, bind: Option<IpAddr>) -> bool {
        let deadline = self.deadline();
        match tokio::time::timeout(deadline, self.command(addr, bind).status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "ping could not be spawned");
                false
            }
            Err(_) => {
                debug!(%addr, secs = deadline.as_secs(), "ping timed out");
                false
            }
        }
    }
}
