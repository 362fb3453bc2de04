/*!
iptables emulator behind the remote-exec seam

Understands the `echo PW | sudo -S -p '' sh -c '...'` wrapper and the
`-C`/`-A`/`-D` forms of reject rules, with iptables' exit codes.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use twin_common::error::TransportError;
use twin_common::remote::{ExecOutput, RemoteExec};
use twin_common::ssh::SshEndpoint;

const BAD_RULE: &str = "iptables: Bad rule (does a matching rule exist in that chain?).\n";

#[derive(Debug, Default)]
struct FirewallState {
    rules: BTreeMap<(String, String), usize>,
    mutations: Vec<String>,
    commands: Vec<String>,
    unreachable: bool,
}

#[derive(Clone)]
pub struct FakeIptables {
    sudo_password: String,
    state: Arc<Mutex<FirewallState>>,
}

impl FakeIptables {
    pub fn new(sudo_password: &str) -> Self {
        Self { sudo_password: sudo_password.to_string(), state: Arc::default() }
    }

    pub fn rule_count(&self, chain: &str, addr: &str) -> usize {
        let key = (chain.to_string(), addr.to_string());
        self.state.lock().rules.get(&key).copied().unwrap_or(0)
    }

    /// Install `n` identical reject rules, as left behind by an earlier run.
    pub fn preload(&self, chain: &str, addr: &str, n: usize) {
        *self.state.lock().rules.entry((chain.to_string(), addr.to_string())).or_default() += n;
    }

    /// Successful `-A`/`-D` invocations, e.g. `-A OUTPUT 10.10.0.2`.
    pub fn mutations(&self) -> Vec<String> {
        self.state.lock().mutations.clone()
    }

    /// Every raw command received.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    fn unwrap_sudo(&self, command: &str) -> Result<String, ExecOutput> {
        let words = shell_words::split(command).map_err(|e| failed(2, &format!("sh: {e}\n")))?;
        if words.first().map(String::as_str) != Some("echo") {
            return Ok(command.to_string());
        }
        let password = words.get(1).cloned().unwrap_or_default();
        if password != self.sudo_password {
            return Err(failed(1, "Sorry, try again.\nsudo: 1 incorrect password attempt\n"));
        }
        words.last().cloned().ok_or_else(|| failed(2, "sh: missing command\n"))
    }

    fn iptables(&self, inner: &str) -> ExecOutput {
        let Ok(words) = shell_words::split(inner) else {
            return failed(2, "sh: syntax error\n");
        };
        let (op, chain, addr) = match words.as_slice() {
            [tool, op, chain, d, addr, j, target]
                if (tool == "iptables" || tool == "ip6tables") && d == "-d" && j == "-j" && target == "REJECT" =>
            {
                (op.as_str(), chain.clone(), addr.clone())
            }
            _ => return failed(2, &format!("iptables v1.8.7 (nf_tables): unknown arguments: {inner}\n")),
        };

        let mut state = self.state.lock();
        let key = (chain.clone(), addr.clone());
        let count = state.rules.get(&key).copied().unwrap_or(0);
        match op {
            "-C" if count > 0 => ExecOutput::exited(0),
            "-C" => failed(1, BAD_RULE),
            "-A" => {
                state.rules.insert(key, count + 1);
                state.mutations.push(format!("-A {chain} {addr}"));
                ExecOutput::exited(0)
            }
            "-D" if count > 0 => {
                state.rules.insert(key, count - 1);
                state.mutations.push(format!("-D {chain} {addr}"));
                ExecOutput::exited(0)
            }
            "-D" => failed(1, BAD_RULE),
            other => failed(2, &format!("iptables v1.8.7 (nf_tables): unknown option \"{other}\"\n")),
        }
    }
}

fn failed(status: u32, stderr: &str) -> ExecOutput {
    ExecOutput { exit_status: Some(status), stdout: String::new(), stderr: stderr.to_string() }
}

#[async_trait]
impl RemoteExec for FakeIptables {
    async fn exec(&mut self, endpoint: &SshEndpoint, command: &str) -> Result<ExecOutput, TransportError> {
        {
            let mut state = self.state.lock();
            if state.unreachable {
                return Err(TransportError::Connect {
                    host: endpoint.host.to_string(),
                    reason: "no route to host".into(),
                });
            }
            state.commands.push(command.to_string());
        }
        Ok(match self.unwrap_sudo(command) {
            Ok(inner) => self.iptables(&inner),
            Err(refused) => refused,
        })
    }

    async fn close_all(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> SshEndpoint {
        SshEndpoint {
            host: "10.10.0.3".parse().unwrap(),
            port: 22,
            bind: None,
            user: "pi".into(),
            password: "raspberry".into(),
        }
    }

    #[tokio::test]
    async fn test_exit_codes_follow_iptables() {
        let mut fw = FakeIptables::new("raspberry");
        let ep = endpoint();
        let check = "echo raspberry | sudo -S -p '' sh -c 'iptables -C OUTPUT -d 10.10.0.2 -j REJECT'";
        let add = "echo raspberry | sudo -S -p '' sh -c 'iptables -A OUTPUT -d 10.10.0.2 -j REJECT'";

        assert_eq!(fw.exec(&ep, check).await.unwrap().exit_status, Some(1));
        assert!(fw.exec(&ep, add).await.unwrap().success());
        assert!(fw.exec(&ep, check).await.unwrap().success());
        assert_eq!(fw.mutations(), vec!["-A OUTPUT 10.10.0.2"]);
    }

    #[tokio::test]
    async fn test_wrong_password_and_unreachable_host() {
        let mut fw = FakeIptables::new("secret");
        let ep = endpoint();
        let out = fw.exec(&ep, "echo wrong | sudo -S -p '' sh -c 'iptables -A OUTPUT -d 10.10.0.2 -j REJECT'").await.unwrap();
        assert_eq!(out.exit_status, Some(1));
        assert!(out.stderr.starts_with("Sorry, try again."));
        assert_eq!(fw.rule_count("OUTPUT", "10.10.0.2"), 0);

        fw.set_unreachable(true);
        assert!(fw.exec(&ep, "iptables -C OUTPUT -d 10.10.0.2 -j REJECT").await.is_err());
    }
}
