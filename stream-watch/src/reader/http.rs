//! HTTP page reader driven by per-website extraction profiles.
//!
//! Each website is described by a [`ReaderProfile`]: a URL template and the
//! regular expressions that pull the viewer count and current game out of
//! the fetched page. A target may override its website's profile through
//! its opaque environment value.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use url::Url;

use super::{PageReader, PageSession, ReadError};
use crate::domain::Target;
use crate::{Error, Result};

/// Default request timeout for page fetches.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// How to locate and read one website's channel pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderProfile {
    /// Page URL with a `{channel}` placeholder.
    pub url_template: String,
    /// Pattern whose first capture group is the viewer count text.
    pub viewers_pattern: String,
    /// Pattern whose first capture group is the current game/category.
    #[serde(default)]
    pub game_pattern: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ReaderProfile {
    /// Resolve the page URL for a channel.
    pub fn page_url(&self, channel: &str) -> std::result::Result<Url, ReadError> {
        let raw = self.url_template.replace("{channel}", channel);
        Url::parse(&raw)
            .map_err(|e| ReadError::permanent(format!("invalid page url {}: {}", raw, e)))
    }

    fn compile(&self) -> std::result::Result<(Regex, Option<Regex>), ReadError> {
        let viewers = Regex::new(&self.viewers_pattern)
            .map_err(|e| ReadError::permanent(format!("invalid viewers pattern: {}", e)))?;
        let game = self
            .game_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| ReadError::permanent(format!("invalid game pattern: {}", e)))?;
        Ok((viewers, game))
    }
}

/// Load website profiles from a JSON object keyed by website name.
pub async fn load_profiles(path: &Path) -> Result<HashMap<String, ReaderProfile>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::store("reading", path, e))?;
    let profiles: HashMap<String, ReaderProfile> = serde_json::from_str(&content)?;
    debug!(path = %path.display(), count = profiles.len(), "Loaded reader profiles");
    Ok(profiles)
}

/// Parse viewer count text such as `1234`, `1,234`, `1.2K` or `3M`.
pub fn parse_viewer_count(raw: &str) -> Option<u64> {
    let text = raw.trim();

    let suffixed = [('k', 1_000.0), ('K', 1_000.0), ('m', 1_000_000.0), ('M', 1_000_000.0)]
        .into_iter()
        .find_map(|(suffix, multiplier)| text.strip_suffix(suffix).map(|n| (n, multiplier)));

    if let Some((number, multiplier)) = suffixed {
        let value: f64 = number.trim().replace(',', ".").parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        return Some((value * multiplier).round() as u64);
    }

    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate installed one first
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// [`PageReader`] that fetches channel pages over HTTP.
pub struct HttpPageReader {
    client: reqwest::Client,
    profiles: HashMap<String, ReaderProfile>,
}

impl HttpPageReader {
    pub fn new(profiles: HashMap<String, ReaderProfile>) -> Result<Self> {
        install_rustls_provider();
        let client = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .build()?;
        Ok(Self { client, profiles })
    }

    pub fn profile_count(&self) -> usize {
        self.profiles.len()
    }

    fn resolve_profile(&self, target: &Target) -> std::result::Result<ReaderProfile, ReadError> {
        if let Some(environment) = &target.environment {
            return serde_json::from_value(environment.as_ref().clone()).map_err(|e| {
                ReadError::permanent(format!("invalid target environment: {}", e))
            });
        }

        self.profiles.get(target.website()).cloned().ok_or_else(|| {
            ReadError::permanent(format!("no reader profile for website {}", target.website()))
        })
    }
}

#[async_trait]
impl PageReader for HttpPageReader {
    async fn open(&self, target: &Target) -> std::result::Result<Box<dyn PageSession>, ReadError> {
        let profile = self.resolve_profile(target)?;
        let url = profile.page_url(target.channel())?;
        let (viewers, game) = profile.compile()?;

        let mut session = HttpSession {
            client: self.client.clone(),
            url,
            timeout: Duration::from_secs(profile.timeout_secs),
            viewers,
            game,
            body: None,
        };

        session.fetch().await?;
        if session.extract_viewers().is_none() {
            return Err(ReadError::transient(format!(
                "viewer count not found on {}",
                session.url
            )));
        }

        debug!(website = target.website(), channel = target.channel(), url = %session.url, "Opened page");
        Ok(Box::new(session))
    }
}

struct HttpSession {
    client: reqwest::Client,
    url: Url,
    timeout: Duration,
    viewers: Regex,
    game: Option<Regex>,
    body: Option<String>,
}

impl HttpSession {
    async fn fetch(&mut self) -> std::result::Result<(), ReadError> {
        let response = self
            .client
            .get(self.url.clone())
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        trace!(url = %self.url, bytes = body.len(), "Fetched page");
        self.body = Some(body);
        Ok(())
    }

    fn capture<'a>(pattern: &Regex, body: &'a str) -> Option<&'a str> {
        let captures = pattern.captures(body)?;
        captures
            .get(1)
            .or_else(|| captures.get(0))
            .map(|m| m.as_str())
    }

    fn extract_viewers(&self) -> Option<u64> {
        let body = self.body.as_deref()?;
        Self::capture(&self.viewers, body).and_then(parse_viewer_count)
    }

    fn extract_game(&self) -> Option<String> {
        let body = self.body.as_deref()?;
        let pattern = self.game.as_ref()?;
        let game = Self::capture(pattern, body)?.trim().replace("&amp;", "&");
        (!game.is_empty()).then_some(game)
    }
}

#[async_trait]
impl PageSession for HttpSession {
    async fn reload(&mut self) -> std::result::Result<(), ReadError> {
        self.fetch().await
    }

    async fn read_viewers(&mut self) -> Option<u64> {
        self.extract_viewers()
    }

    async fn read_game(&mut self) -> Option<String> {
        self.extract_game()
    }

    async fn close(&mut self) {
        if self.body.take().is_some() {
            trace!(url = %self.url, "Closed page");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TargetKey;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Serve a fixed HTML body over plain HTTP for every request.
    async fn serve(body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    fn profile(base: &str) -> ReaderProfile {
        ReaderProfile {
            url_template: format!("{}/{{channel}}", base),
            viewers_pattern: r#"data-viewers="([^"]+)""#.to_string(),
            game_pattern: Some(r#"data-game="([^"]+)""#.to_string()),
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_parse_viewer_count() {
        assert_eq!(parse_viewer_count("1234"), Some(1234));
        assert_eq!(parse_viewer_count(" 1,234 "), Some(1234));
        assert_eq!(parse_viewer_count("12 345 viewers"), Some(12345));
        assert_eq!(parse_viewer_count("1.2K"), Some(1200));
        assert_eq!(parse_viewer_count("1,5k"), Some(1500));
        assert_eq!(parse_viewer_count("3M"), Some(3_000_000));
        assert_eq!(parse_viewer_count("live"), None);
        assert_eq!(parse_viewer_count("K"), None);
    }

    #[test]
    fn test_page_url() {
        let profile = profile("https://example.com");
        let url = profile.page_url("gaules").unwrap();
        assert_eq!(url.as_str(), "https://example.com/gaules");
    }

    #[test]
    fn test_invalid_pattern_is_permanent() {
        let mut profile = profile("https://example.com");
        profile.viewers_pattern = "(".to_string();
        let err = profile.compile().unwrap_err();
        assert!(!err.transient);
    }

    #[test]
    fn test_profile_deserializes_with_defaults() {
        let json = r#"{"url_template":"https://x.tv/{channel}","viewers_pattern":"(\\d+)"}"#;
        let profile: ReaderProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert!(profile.game_pattern.is_none());
    }

    #[tokio::test]
    async fn test_load_profiles_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.json");
        std::fs::write(
            &path,
            r#"{"twitch":{"url_template":"https://twitch.tv/{channel}","viewers_pattern":"(\\d+)"}}"#,
        )
        .unwrap();

        let profiles = load_profiles(&path).await.unwrap();
        assert!(profiles.contains_key("twitch"));
    }

    #[tokio::test]
    async fn test_open_and_read() {
        let base = serve(r#"<div data-viewers="1,234" data-game="Counter-Strike &amp; Co"></div>"#).await;
        let reader =
            HttpPageReader::new(HashMap::from([("twitch".to_string(), profile(&base))])).unwrap();
        let target = Target::new(TargetKey::new("twitch", "gaules"));

        let mut session = reader.open(&target).await.unwrap();
        session.reload().await.unwrap();
        assert_eq!(session.read_viewers().await, Some(1234));
        assert_eq!(session.read_game().await, Some("Counter-Strike & Co".to_string()));

        session.close().await;
        session.close().await;
        assert_eq!(session.read_viewers().await, None);
    }

    #[tokio::test]
    async fn test_open_fails_when_viewers_missing() {
        let base = serve("<div>offline</div>").await;
        let reader =
            HttpPageReader::new(HashMap::from([("twitch".to_string(), profile(&base))])).unwrap();
        let target = Target::new(TargetKey::new("twitch", "gaules"));

        let err = reader.open(&target).await.err().unwrap();
        assert!(err.transient);
    }

    #[tokio::test]
    async fn test_open_without_profile_fails() {
        let reader = HttpPageReader::new(HashMap::new()).unwrap();
        let target = Target::new(TargetKey::new("facebook", "pagexyz"));

        let err = reader.open(&target).await.err().unwrap();
        assert!(!err.transient);
    }

    #[tokio::test]
    async fn test_target_environment_overrides_profile() {
        let base = serve(r#"<span class="count">42</span>"#).await;
        let reader = HttpPageReader::new(HashMap::new()).unwrap();
        let environment = serde_json::json!({
            "url_template": format!("{}/{{channel}}", base),
            "viewers_pattern": r#"class="count">(\d+)<"#,
        });
        let target =
            Target::new(TargetKey::new("custom", "room1")).with_environment(environment);

        let mut session = reader.open(&target).await.unwrap();
        assert_eq!(session.read_viewers().await, Some(42));
        assert_eq!(session.read_game().await, None);
    }
}
