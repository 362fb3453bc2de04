//! Linux firewall backend
//!
//! Isolates a digital Linux host from one peer with an egress REJECT rule,
//! issued over SSH through `sudo -S`. Presence is always checked with `-C`
//! before mutating, so repeated calls converge instead of stacking rules.

use async_trait::async_trait;
use std::net::IpAddr;
use tracing::{debug, info};
use twin_common::cli::tokens::SUDO_AUTH_FAILURES;
use twin_common::enforcement::{BackendKind, EnforcementBackend, EnforcementTarget, Outcome};
use twin_common::error::SyncError;
use twin_common::remote::{ExecOutput, RemoteExec};

/// Upper bound on duplicate rules removed by one unblock.
const MAX_DUPLICATE_CLEANUP: usize = 8;

pub struct LinuxFirewallBackend<R> {
    exec: R,
    chain: String,
}

impl<R: RemoteExec> LinuxFirewallBackend<R> {
    pub fn new(exec: R, chain: impl Into<String>) -> Self {
        Self { exec, chain: chain.into() }
    }

    fn rule(&self, op: char, peer: IpAddr) -> String {
        let tool = if peer.is_ipv6() { "ip6tables" } else { "iptables" };
        format!("{tool} -{op} {} -d {peer} -j REJECT", self.chain)
    }

    async fn run(&mut self, target: &EnforcementTarget, op: char) -> Result<(String, ExecOutput), SyncError> {
        let rule = self.rule(op, target.peer_address);
        let command = privileged(&rule, &target.endpoint.user, &target.secret);
        let out = self.exec.exec(&target.endpoint, &command).await?;
        if SUDO_AUTH_FAILURES.scan(&out.stderr).is_matched() {
            return Err(SyncError::Authentication {
                host: target.endpoint.host.to_string(),
                user: target.endpoint.user.clone(),
            });
        }
        Ok((rule, out))
    }

    async fn present(&mut self, target: &EnforcementTarget) -> Result<bool, SyncError> {
        let (rule, out) = self.run(target, 'C').await?;
        match out.exit_status {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            other => Err(command_failed(target, rule, other, out.stderr)),
        }
    }

    fn describe(&self, target: &EnforcementTarget, present: bool) -> String {
        let state = if present { "present" } else { "absent" };
        format!("{} {state}", self.rule('A', target.peer_address))
    }
}

#[async_trait]
impl<R: RemoteExec> EnforcementBackend for LinuxFirewallBackend<R> {
    fn kind(&self) -> BackendKind {
        BackendKind::LinuxFirewall
    }

    async fn is_blocked(&mut self, target: &EnforcementTarget) -> Result<bool, SyncError> {
        self.present(target).await
    }

    async fn block(&mut self, target: &EnforcementTarget) -> Result<Outcome, SyncError> {
        if self.present(target).await? {
            return Ok(Outcome::unchanged(self.describe(target, true)));
        }
        let (rule, out) = self.run(target, 'A').await?;
        if !out.success() {
            return Err(command_failed(target, rule, out.exit_status, out.stderr));
        }
        let before = self.describe(target, false);
        if !self.present(target).await? {
            return Err(SyncError::VerificationMismatch {
                host: target.endpoint.host.to_string(),
                peer: target.peer.clone(),
                expected: true,
                after: before.clone(),
                before,
            });
        }
        info!(host = %target.endpoint.host, peer = %target.peer_address, "reject rule added");
        Ok(Outcome { changed: true, before, after: self.describe(target, true) })
    }

    async fn unblock(&mut self, target: &EnforcementTarget) -> Result<Outcome, SyncError> {
        if !self.present(target).await? {
            return Ok(Outcome::unchanged(self.describe(target, false)));
        }
        let before = self.describe(target, true);
        let mut removed = 0;
        let mut still_present = true;
        while still_present && removed < MAX_DUPLICATE_CLEANUP {
            let (rule, out) = self.run(target, 'D').await?;
            if !out.success() {
                return Err(command_failed(target, rule, out.exit_status, out.stderr));
            }
            removed += 1;
            still_present = self.present(target).await?;
        }
        if still_present {
            return Err(SyncError::VerificationMismatch {
                host: target.endpoint.host.to_string(),
                peer: target.peer.clone(),
                expected: false,
                after: before.clone(),
                before,
            });
        }
        if removed > 1 {
            debug!(host = %target.endpoint.host, peer = %target.peer_address, removed, "removed duplicate reject rules");
        }
        info!(host = %target.endpoint.host, peer = %target.peer_address, "reject rule removed");
        Ok(Outcome { changed: true, before, after: self.describe(target, false) })
    }

    async fn close(&mut self) {
        self.exec.close_all().await;
    }
}

/// Wrap `command` so it runs as root. The password reaches sudo on stdin.
pub fn privileged(command: &str, user: &str, password: &str) -> String {
    if user == "root" {
        return command.to_string();
    }
    format!(
        "echo {} | sudo -S -p '' sh -c {}",
        shell_words::quote(password),
        shell_words::quote(command)
    )
}

fn command_failed(target: &EnforcementTarget, command: String, status: Option<u32>, stderr: String) -> SyncError {
    SyncError::RemoteCommand {
        host: target.endpoint.host.to_string(),
        command,
        status: status.unwrap_or(u32::MAX),
        stderr: stderr.trim().to_string(),
    }
}
