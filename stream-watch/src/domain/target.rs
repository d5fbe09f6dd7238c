//! Stream target identity and tracked attributes.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::observation::Observation;
use super::status::StreamStatus;

/// Unique identity of a watched stream: `(website, channel)`.
///
/// Both parts are case-sensitive and compared exactly as provided.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetKey {
    pub website: String,
    pub channel: String,
}

impl TargetKey {
    pub fn new(website: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            website: website.into(),
            channel: channel.into(),
        }
    }

    /// Parse a persisted `website,channel` line.
    ///
    /// Returns `None` unless the line splits into exactly two non-empty
    /// fields. Surrounding whitespace (including a trailing `\r`) is ignored.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.trim().split(',');
        let website = fields.next()?.trim();
        let channel = fields.next()?.trim();

        if fields.next().is_some() || website.is_empty() || channel.is_empty() {
            return None;
        }

        Some(Self::new(website, channel))
    }

    /// Render as a persisted `website,channel` line.
    pub fn to_line(&self) -> String {
        format!("{},{}", self.website, self.channel)
    }

    /// File name for this target's observation log.
    pub fn metrics_file_name(&self) -> String {
        let sanitize = |s: &str| -> String {
            s.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect()
        };
        format!("{}_{}.csv", sanitize(&self.website), sanitize(&self.channel))
    }
}

impl std::fmt::Display for TargetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.website, self.channel)
    }
}

/// A tracked stream and its current supervision state.
///
/// Instances handed out by the registry are point-in-time copies.
#[derive(Debug, Clone)]
pub struct Target {
    pub key: TargetKey,
    pub status: StreamStatus,
    /// One-shot backoff deadline; set while `Waiting`.
    pub wait_deadline: Option<Instant>,
    /// One-shot deadline for the next read; set while `Running`.
    pub next_read_at: Option<Instant>,
    pub consecutive_failures: u32,
    pub last_observation: Option<Observation>,
    /// Reader-specific settings (URL, extraction patterns). Opaque to the
    /// scheduler and only interpreted by the page reader.
    pub environment: Option<Arc<serde_json::Value>>,
}

impl Target {
    pub fn new(key: TargetKey) -> Self {
        Self {
            key,
            status: StreamStatus::Stopped,
            wait_deadline: None,
            next_read_at: None,
            consecutive_failures: 0,
            last_observation: None,
            environment: None,
        }
    }

    pub fn with_environment(mut self, environment: serde_json::Value) -> Self {
        self.environment = Some(Arc::new(environment));
        self
    }

    pub fn website(&self) -> &str {
        &self.key.website
    }

    pub fn channel(&self) -> &str {
        &self.key.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(
            TargetKey::parse_line("twitch,gaules"),
            Some(TargetKey::new("twitch", "gaules"))
        );
        assert_eq!(
            TargetKey::parse_line(" facebook , pagexyz \r"),
            Some(TargetKey::new("facebook", "pagexyz"))
        );
    }

    #[test]
    fn test_parse_line_rejects_malformed() {
        assert_eq!(TargetKey::parse_line(""), None);
        assert_eq!(TargetKey::parse_line("twitch"), None);
        assert_eq!(TargetKey::parse_line("twitch,"), None);
        assert_eq!(TargetKey::parse_line(",gaules"), None);
        assert_eq!(TargetKey::parse_line("twitch,gaules,extra"), None);
    }

    #[test]
    fn test_keys_are_case_sensitive() {
        assert_ne!(
            TargetKey::new("twitch", "Gaules"),
            TargetKey::new("twitch", "gaules")
        );
    }

    #[test]
    fn test_line_round_trip() {
        let key = TargetKey::new("youtube", "somechannel");
        assert_eq!(TargetKey::parse_line(&key.to_line()), Some(key));
    }

    #[test]
    fn test_metrics_file_name_is_sanitized() {
        let key = TargetKey::new("twitch", "a/b c");
        assert_eq!(key.metrics_file_name(), "twitch_a_b_c.csv");
    }

    #[test]
    fn test_new_target_is_stopped() {
        let target = Target::new(TargetKey::new("twitch", "gaules"));
        assert_eq!(target.status, StreamStatus::Stopped);
        assert!(target.wait_deadline.is_none());
        assert_eq!(target.website(), "twitch");
        assert_eq!(target.channel(), "gaules");
    }
}
