//! Host-side liveness checks: ICMP ping and the protocol fallbacks

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, QoS};
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use twin_common::bus::mqtt_options;
use twin_common::config::MqttConf;
use twin_common::error::{SyncError, TransportError};
use twin_common::liveness::{Fallback, LivenessCheck, PeerTarget};
use twin_common::ping::Reachability;

const RTSP_DEFAULT_PORT: u16 = 554;

/// Primary check for hosts: the peer's physical address answers ICMP.
pub struct PingCheck<R> {
    reach: R,
    bind: Option<IpAddr>,
}

impl<R: Reachability> PingCheck<R> {
    pub fn new(reach: R, bind: Option<IpAddr>) -> Self {
        Self { reach, bind }
    }
}

#[async_trait]
impl<R: Reachability> LivenessCheck for PingCheck<R> {
    fn kind(&self) -> &'static str {
        "ping"
    }

    async fn check(&mut self, peer: &PeerTarget) -> Result<bool, SyncError> {
        Ok(self.reach.reachable(peer.address, self.bind).await)
    }
}

/// Second opinion for a failed primary check, driven by the peer's
/// configured [`Fallback`]. Peers without one are reported dead.
pub struct FallbackProbe {
    device: String,
    mqtt: MqttConf,
    mqtt_host: String,
    window: Duration,
}

impl FallbackProbe {
    pub fn new(device: &str, mqtt: MqttConf, mqtt_host: String, window: Duration) -> Self {
        Self { device: device.to_string(), mqtt, mqtt_host, window }
    }

    /// Subscribe briefly with a throwaway client; any message in the window counts.
    async fn recent_message(&self, topic: &str) -> Result<bool, SyncError> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let client_id = format!("{}-fallback-{}", self.device, &suffix[..8]);
        let opts = mqtt_options(&self.mqtt, &self.mqtt_host, &client_id);
        let (client, mut eventloop) = AsyncClient::new(opts, 10);

        let watch = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        client.try_subscribe(topic, QoS::AtMostOnce).map_err(|e| e.to_string())?;
                    }
                    Ok(Event::Incoming(Incoming::Publish(msg))) => {
                        debug!(topic = %msg.topic, bytes = msg.payload.len(), "fallback message seen");
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => return Err(e.to_string()),
                }
            }
        };
        let seen = timeout(self.window, watch).await;
        let _ = client.try_disconnect();

        match seen {
            Ok(Ok(())) => Ok(true),
            Ok(Err(reason)) => Err(TransportError::Connect { host: self.mqtt_host.clone(), reason }.into()),
            Err(_) => Ok(false),
        }
    }
}

#[async_trait]
impl LivenessCheck for FallbackProbe {
    fn kind(&self) -> &'static str {
        "fallback"
    }

    async fn check(&mut self, peer: &PeerTarget) -> Result<bool, SyncError> {
        match &peer.fallback {
            Some(Fallback::RecentMessage { topic }) => self.recent_message(topic).await,
            Some(Fallback::Rtsp { url }) => rtsp_options(url, self.window).await,
            None => Ok(false),
        }
    }
}

/// `host` and `port` of an `rtsp://` URL.
fn rtsp_authority(url: &str) -> Option<(String, u16)> {
    let rest = url.strip_prefix("rtsp://")?;
    let authority = rest.split('/').next()?;
    let authority = authority.rsplit('@').next()?;
    if let Some(v6) = authority.strip_prefix('[') {
        let (host, tail) = v6.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => RTSP_DEFAULT_PORT,
        };
        return Some((host.to_string(), port));
    }
    match authority.split_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None if !authority.is_empty() => Some((authority.to_string(), RTSP_DEFAULT_PORT)),
        None => None,
    }
}

/// A camera is alive when its RTSP server answers `OPTIONS` with 200.
pub async fn rtsp_options(url: &str, limit: Duration) -> Result<bool, SyncError> {
    let (host, port) = rtsp_authority(url)
        .ok_or_else(|| SyncError::Unsupported(format!("not an rtsp url: {url}")))?;
    let transport = |reason: String| SyncError::from(TransportError::Connect { host: host.clone(), reason });

    let exchange = async {
        let mut stream = TcpStream::connect((host.as_str(), port)).await?;
        let request = format!("OPTIONS {url} RTSP/1.0\r\nCSeq: 1\r\nUser-Agent: twin-probe\r\n\r\n");
        stream.write_all(request.as_bytes()).await?;
        let mut buf = [0u8; 512];
        let n = stream.read(&mut buf).await?;
        Ok::<_, std::io::Error>(String::from_utf8_lossy(&buf[..n]).into_owned())
    };
    match timeout(limit, exchange).await {
        Ok(Ok(reply)) => {
            let status = reply.lines().next().unwrap_or_default();
            debug!(%url, status, "rtsp options");
            Ok(status.starts_with("RTSP/1.0 200"))
        }
        Ok(Err(e)) => Err(transport(e.to_string())),
        Err(_) => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use twin_devkit::test_utils::ScriptedReachability;

    fn peer(addr: &str, fallback: Option<Fallback>) -> PeerTarget {
        PeerTarget { name: "ipcam".into(), address: addr.parse().unwrap(), fallback }
    }

    #[tokio::test]
    async fn test_ping_check_uses_bind_address() {
        let reach = ScriptedReachability::default();
        reach.set("192.168.20.4".parse().unwrap(), false);
        let bind: IpAddr = "192.168.20.250".parse().unwrap();
        let mut check = PingCheck::new(reach.clone(), Some(bind));

        assert!(!check.check(&peer("192.168.20.4", None)).await.unwrap());
        assert!(check.check(&peer("192.168.20.2", None)).await.unwrap());
        assert!(reach.probes().iter().all(|(_, b)| *b == Some(bind)));
    }

    #[test]
    fn test_rtsp_authority_parsing() {
        assert_eq!(rtsp_authority("rtsp://192.168.20.4/stream1"), Some(("192.168.20.4".into(), 554)));
        assert_eq!(rtsp_authority("rtsp://cam:8554/live"), Some(("cam".into(), 8554)));
        assert_eq!(rtsp_authority("rtsp://admin:pw@10.0.0.9:554/s"), Some(("10.0.0.9".into(), 554)));
        assert_eq!(rtsp_authority("rtsp://[fd00::4]/s"), Some(("fd00::4".into(), 554)));
        assert_eq!(rtsp_authority("http://cam/"), None);
    }

    async fn rtsp_server(reply: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let _ = sock.read(&mut buf).await;
            sock.write_all(reply.as_bytes()).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_rtsp_options_accepts_only_200() {
        let ok = rtsp_server("RTSP/1.0 200 OK\r\nCSeq: 1\r\nPublic: OPTIONS, DESCRIBE\r\n\r\n").await;
        let url = format!("rtsp://127.0.0.1:{ok}/stream1");
        assert!(rtsp_options(&url, Duration::from_secs(2)).await.unwrap());

        let denied = rtsp_server("RTSP/1.0 401 Unauthorized\r\nCSeq: 1\r\n\r\n").await;
        let url = format!("rtsp://127.0.0.1:{denied}/stream1");
        assert!(!rtsp_options(&url, Duration::from_secs(2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_rtsp_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = rtsp_options(&format!("rtsp://127.0.0.1:{port}/s"), Duration::from_secs(2)).await.unwrap_err();
        assert_eq!(err.class(), "transient_network");
    }

    #[tokio::test]
    async fn test_peer_without_fallback_is_dead() {
        let mut probe = FallbackProbe::new("sensor", MqttConf::default(), "127.0.0.1".into(), Duration::from_millis(50));
        assert!(!probe.check(&peer("192.168.20.4", None)).await.unwrap());
    }
}
