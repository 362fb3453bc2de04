// Health events and topic conventions shared by probes and the coordinator

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

impl HealthStatus {
    pub fn from_ok(ok: bool) -> Self {
        if ok { HealthStatus::Up } else { HealthStatus::Down }
    }

    pub fn is_up(self) -> bool {
        self == HealthStatus::Up
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Up => "UP",
            HealthStatus::Down => "DOWN",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "UP" => Some(HealthStatus::Up),
            "DOWN" => Some(HealthStatus::Down),
            _ => None,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire payload: `{"status":"UP"|"DOWN","time":"<ISO8601>"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthPayload {
    pub status: HealthStatus,
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub source: String,
    pub target: String,
    pub status: HealthStatus,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventParseError {
    #[error("topic '{0}' is outside the health prefix")]
    ForeignTopic(String),
    #[error("topic '{0}' is not <prefix>/<source>/<target>")]
    BadTopic(String),
    #[error("payload carries no UP/DOWN status: {0}")]
    BadPayload(String),
}

pub fn health_topic(prefix: &str, source: &str, target: &str) -> String {
    format!("{}/{source}/{target}", prefix.trim_matches('/'))
}

pub fn health_filter(prefix: &str) -> String {
    format!("{}/#", prefix.trim_matches('/'))
}

impl HealthEvent {
    pub fn new(source: impl Into<String>, target: impl Into<String>, status: HealthStatus) -> Self {
        Self { source: source.into(), target: target.into(), status, time: Utc::now() }
    }

    pub fn topic(&self, prefix: &str) -> String {
        health_topic(prefix, &self.source, &self.target)
    }

    pub fn payload(&self) -> HealthPayload {
        HealthPayload { status: self.status, time: self.time.to_rfc3339() }
    }

    pub fn pair(&self) -> PairKey {
        PairKey::new(&self.source, &self.target)
    }

    /// Decode a bus message. Accepts a JSON object with a `status` (or
    /// `state`) field in any case, or a bare `UP`/`DOWN` body. A missing or
    /// unparseable time means "now"; naive timestamps are taken as UTC.
    pub fn from_message(prefix: &str, topic: &str, payload: &[u8]) -> Result<Self, EventParseError> {
        let prefix = prefix.trim_matches('/');
        let rest = topic
            .strip_prefix(prefix)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| EventParseError::ForeignTopic(topic.to_string()))?;
        let mut parts = rest.split('/');
        let (source, target) = match (parts.next(), parts.next(), parts.next()) {
            (Some(s), Some(t), None) if !s.is_empty() && !t.is_empty() => (s, t),
            _ => return Err(EventParseError::BadTopic(topic.to_string())),
        };

        let text = String::from_utf8_lossy(payload);
        let (status, time) = match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(serde_json::Value::Object(map)) => {
                let status = map
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("status") || k.eq_ignore_ascii_case("state"))
                    .and_then(|(_, v)| v.as_str())
                    .and_then(HealthStatus::parse);
                let time = map.get("time").and_then(|v| v.as_str()).and_then(parse_time);
                (status, time)
            }
            Ok(serde_json::Value::String(s)) => (HealthStatus::parse(&s), None),
            _ => (HealthStatus::parse(&text), None),
        };
        let status = status.ok_or_else(|| EventParseError::BadPayload(text.chars().take(120).collect()))?;

        Ok(Self {
            source: source.to_string(),
            target: target.to_string(),
            status,
            time: time.unwrap_or_else(Utc::now),
        })
    }
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Unordered pair of device names; `PairKey::new(a, b) == PairKey::new(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    a: String,
    b: String,
}

impl PairKey {
    pub fn new(x: &str, y: &str) -> Self {
        if x <= y {
            Self { a: x.to_string(), b: y.to_string() }
        } else {
            Self { a: y.to_string(), b: x.to_string() }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.a == name || self.b == name
    }

    pub fn members(&self) -> (&str, &str) {
        (&self.a, &self.b)
    }

    pub fn other(&self, name: &str) -> Option<&str> {
        if self.a == name {
            Some(&self.b)
        } else if self.b == name {
            Some(&self.a)
        } else {
            None
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.a, self.b)
    }
}

impl Serialize for PairKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_reference_event() {
        let ev = HealthEvent::from_message(
            "health",
            "health/sensor/broker",
            br#"{"status":"DOWN","time":"2024-01-01T00:00:00"}"#,
        )
        .unwrap();
        assert_eq!(ev.source, "sensor");
        assert_eq!(ev.target, "broker");
        assert_eq!(ev.status, HealthStatus::Down);
        assert_eq!(ev.time, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_lenient_payloads() {
        let ev = HealthEvent::from_message("health", "health/a/b", br#"{"State":"up"}"#).unwrap();
        assert_eq!(ev.status, HealthStatus::Up);
        let ev = HealthEvent::from_message("health", "health/a/b", b"DOWN").unwrap();
        assert_eq!(ev.status, HealthStatus::Down);
        let ev = HealthEvent::from_message("lab/health/", "lab/health/a/b", br#"{"status":"UP","time":"2024-01-01T00:00:00+02:00"}"#)
            .unwrap();
        assert_eq!(ev.time, Utc.with_ymd_and_hms(2023, 12, 31, 22, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_rejects_bad_topics_and_payloads() {
        assert!(matches!(
            HealthEvent::from_message("health", "telemetry/a/b", b"UP"),
            Err(EventParseError::ForeignTopic(_))
        ));
        assert!(matches!(
            HealthEvent::from_message("health", "health/a", b"UP"),
            Err(EventParseError::BadTopic(_))
        ));
        assert!(matches!(
            HealthEvent::from_message("health", "health/a/b/c", b"UP"),
            Err(EventParseError::BadTopic(_))
        ));
        assert!(matches!(
            HealthEvent::from_message("health", "health/a/b", br#"{"status":"MAYBE"}"#),
            Err(EventParseError::BadPayload(_))
        ));
    }

    #[test]
    fn test_payload_round_trips_through_parser() {
        let ev = HealthEvent::new("router", "sensor", HealthStatus::Down);
        let body = serde_json::to_vec(&ev.payload()).unwrap();
        let back = HealthEvent::from_message("health", &ev.topic("health"), &body).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn test_pair_key_is_unordered() {
        let k = PairKey::new("sensor", "broker");
        assert_eq!(k, PairKey::new("broker", "sensor"));
        assert_eq!(k.to_string(), "broker<->sensor");
        assert_eq!(k.other("broker"), Some("sensor"));
        assert_eq!(serde_json::to_string(&k).unwrap(), "\"broker<->sensor\"");
    }
}
