//! Stalker portal client
//!
//! Speaks the JSON-over-HTTP portal protocol for exactly one
//! `(portal_url, mac)` pair. Construction is cheap; callers create a
//! client per operation batch through [`PortalConnector`], which is also
//! the seam test doubles plug into.

use async_trait::async_trait;
use chrono::NaiveDate;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE, REFERER, USER_AGENT};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::PortalConfig;
use crate::errors::PortalError;
use crate::models::{MacProfile, RawChannel, RawEpg, RawGenre};

const STB_USER_AGENT: &str = "Mozilla/5.0 (QtEmbedded; U; Linux; C) AppleWebKit/533.3 \
                              (KHTML, like Gecko) MAG200 stbapp ver: 2 rev: 250 Safari/533.3";
const STB_MODEL: &str = "Model: MAG250; Link: WiFi";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF: [Duration; 3] = [
    Duration::from_millis(250),
    Duration::from_secs(1),
    Duration::from_secs(4),
];
const MAX_ATTEMPTS: usize = 3;

/// Operations available on an authenticated portal session
#[async_trait]
pub trait PortalSession: Send + Sync {
    fn mac(&self) -> &str;
    async fn get_profile(&self) -> Result<MacProfile, PortalError>;
    async fn get_expiry(&self) -> Result<Option<NaiveDate>, PortalError>;
    async fn get_all_channels(&self) -> Result<Vec<RawChannel>, PortalError>;
    async fn get_genres(&self) -> Result<Vec<RawGenre>, PortalError>;
    async fn get_link(&self, cmd: &str) -> Result<String, PortalError>;
    async fn get_epg(&self, period_hours: u32) -> Result<RawEpg, PortalError>;
}

/// Factory for portal sessions; the one injection point the catalog, EPG
/// and streaming paths share.
#[async_trait]
pub trait PortalConnector: Send + Sync {
    async fn connect(
        &self,
        portal: &PortalConfig,
        mac: &str,
    ) -> Result<Box<dyn PortalSession>, PortalError>;
}

/// Production connector: handshakes a [`PortalClient`] per call.
pub struct StalkerConnector {
    timezone: String,
    timeout: Duration,
}

impl StalkerConnector {
    pub fn new(timezone: String) -> Self {
        Self {
            timezone,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(timezone: String, timeout: Duration) -> Self {
        Self { timezone, timeout }
    }
}

#[async_trait]
impl PortalConnector for StalkerConnector {
    async fn connect(
        &self,
        portal: &PortalConfig,
        mac: &str,
    ) -> Result<Box<dyn PortalSession>, PortalError> {
        let proxy = if portal.proxy.is_empty() {
            None
        } else {
            Some(portal.proxy.as_str())
        };
        let mut client = PortalClient::new(&portal.url, mac, proxy, &self.timezone, self.timeout)?;
        client.handshake().await?;
        Ok(Box::new(client))
    }
}

/// One `(portal_url, mac)` protocol speaker
pub struct PortalClient {
    http: reqwest::Client,
    endpoint: String,
    referer: String,
    mac: String,
    timezone: String,
    token: Option<String>,
}

impl PortalClient {
    pub fn new(
        portal_url: &str,
        mac: &str,
        proxy: Option<&str>,
        timezone: &str,
        timeout: Duration,
    ) -> Result<Self, PortalError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| PortalError::Unreachable(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| PortalError::Unreachable(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: portal_endpoint(portal_url),
            referer: referer_base(portal_url),
            mac: mac.to_string(),
            timezone: timezone.to_string(),
            token: None,
        })
    }

    /// Authenticate and store the bearer token. Tokens are never
    /// persisted; a fresh client handshakes again.
    pub async fn handshake(&mut self) -> Result<String, PortalError> {
        let js = self
            .request_js(&[("type", "stb"), ("action", "handshake"), ("token", "")])
            .await?;
        let token = js
            .get("token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                PortalError::AuthFailed("handshake response carried no token".to_string())
            })?
            .to_string();
        self.token = Some(token.clone());
        Ok(token)
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(STB_USER_AGENT));
        let cookie = format!(
            "mac={}; stb_lang=en; timezone={};",
            urlencode(&self.mac),
            urlencode(&self.timezone)
        );
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            headers.insert(COOKIE, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.referer) {
            headers.insert(REFERER, value);
        }
        headers.insert("X-User-Agent", HeaderValue::from_static(STB_MODEL));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    /// One portal call with the standard envelope and retry policy:
    /// up to three attempts, exponential backoff with ±20% jitter, only
    /// transport failures and throttling retried.
    async fn request_js(&self, params: &[(&str, &str)]) -> Result<Value, PortalError> {
        let mut last_error = PortalError::Unreachable("no attempt made".to_string());
        for attempt in 0..MAX_ATTEMPTS {
            match self.request_once(params).await {
                Ok(js) => return Ok(js),
                Err(err) if err.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                    let delay = jittered(BACKOFF[attempt]);
                    debug!(
                        "Portal call retry {}/{} after {:?}: {}",
                        attempt + 1,
                        MAX_ATTEMPTS,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    last_error = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error)
    }

    async fn request_once(&self, params: &[(&str, &str)]) -> Result<Value, PortalError> {
        let mut query: Vec<(&str, &str)> = params.to_vec();
        query.push(("JsHttpRequest", "1-xml"));

        let response = self
            .http
            .get(&self.endpoint)
            .headers(self.headers())
            .query(&query)
            .send()
            .await
            .map_err(|e| PortalError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 || status.as_u16() == 503 {
            return Err(PortalError::Throttled(status.as_u16()));
        }
        if !status.is_success() {
            return Err(PortalError::AuthFailed(format!("HTTP {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| PortalError::AuthFailed(format!("unparseable portal response: {e}")))?;
        match body.get("js") {
            Some(js) => Ok(js.clone()),
            None => Err(PortalError::AuthFailed(
                "portal response missing 'js' envelope".to_string(),
            )),
        }
    }
}

#[async_trait]
impl PortalSession for PortalClient {
    fn mac(&self) -> &str {
        &self.mac
    }

    async fn get_profile(&self) -> Result<MacProfile, PortalError> {
        let js = self
            .request_js(&[
                ("type", "stb"),
                ("action", "get_profile"),
                ("hd", "1"),
                ("auth_second_step", "1"),
            ])
            .await?;
        serde_json::from_value(js)
            .map_err(|e| PortalError::AuthFailed(format!("unexpected profile shape: {e}")))
    }

    async fn get_expiry(&self) -> Result<Option<NaiveDate>, PortalError> {
        let js = self
            .request_js(&[("type", "account_info"), ("action", "get_main_info")])
            .await?;
        let raw = js
            .get("end_date")
            .or_else(|| js.get("phone"))
            .and_then(Value::as_str)
            .unwrap_or("");
        Ok(parse_expiry(raw))
    }

    async fn get_all_channels(&self) -> Result<Vec<RawChannel>, PortalError> {
        let mut channels: Vec<RawChannel> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut page = 0u32;

        // Page until the server stops yielding new ids; servers that
        // ignore the page parameter return the same list and terminate
        // the loop on the second pass.
        loop {
            let page_str = page.to_string();
            let js = self
                .request_js(&[
                    ("type", "itv"),
                    ("action", "get_all_channels"),
                    ("p", &page_str),
                ])
                .await?;
            let data = match js.get("data") {
                Some(Value::Array(items)) => items.clone(),
                Some(Value::Object(map)) => map.values().cloned().collect(),
                _ => Vec::new(),
            };

            let mut new_ids = 0usize;
            for item in data {
                match serde_json::from_value::<RawChannel>(item) {
                    Ok(channel) => {
                        if !channel.id.is_empty() && seen.insert(channel.id.clone()) {
                            channels.push(channel);
                            new_ids += 1;
                        }
                    }
                    Err(err) => {
                        warn!("Skipping malformed channel entry from portal: {err}");
                    }
                }
            }

            if new_ids == 0 {
                break;
            }
            page += 1;
        }

        Ok(channels)
    }

    async fn get_genres(&self) -> Result<Vec<RawGenre>, PortalError> {
        let js = self
            .request_js(&[("type", "itv"), ("action", "get_genres")])
            .await?;
        let items = match js {
            Value::Array(items) => items,
            Value::Object(map) => match map.get("data") {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        Ok(items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect())
    }

    async fn get_link(&self, cmd: &str) -> Result<String, PortalError> {
        let cmd = cmd.trim();
        if cmd.is_empty() {
            return Err(PortalError::NoLink);
        }

        // Direct commands embed the media URL; only localhost sentinels
        // need the create_link round-trip.
        if !cmd.contains("http://localhost/") {
            return extract_url(cmd).ok_or(PortalError::NoLink);
        }

        let js = self
            .request_js(&[
                ("type", "itv"),
                ("action", "create_link"),
                ("cmd", cmd),
                ("series", ""),
                ("forced_storage", "undefined"),
                ("disable_ad", "0"),
                ("download", "0"),
            ])
            .await?;
        let created = js.get("cmd").and_then(Value::as_str).unwrap_or("");
        extract_url(created).ok_or(PortalError::NoLink)
    }

    async fn get_epg(&self, period_hours: u32) -> Result<RawEpg, PortalError> {
        let period = period_hours.to_string();
        let js = self
            .request_js(&[
                ("type", "itv"),
                ("action", "get_epg_info"),
                ("period", &period),
            ])
            .await?;
        let data = js.get("data").cloned().unwrap_or(Value::Null);
        if data.is_null() {
            return Ok(RawEpg::new());
        }
        serde_json::from_value(data)
            .map_err(|e| PortalError::AuthFailed(format!("unexpected EPG shape: {e}")))
    }
}

/// `http://host/c/` → `http://host/portal.php`; explicit `.php` endpoints
/// pass through untouched.
pub fn portal_endpoint(portal_url: &str) -> String {
    let trimmed = portal_url.trim().trim_end_matches('/');
    if trimmed.ends_with(".php") {
        trimmed.to_string()
    } else {
        let base = trimmed.trim_end_matches("/c");
        format!("{base}/portal.php")
    }
}

fn referer_base(portal_url: &str) -> String {
    let trimmed = portal_url.trim().trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) if trimmed[..idx].contains("://") => trimmed[..idx + 1].to_string(),
        _ => format!("{trimmed}/"),
    }
}

/// Pull the first http(s) URL out of a portal cmd string
/// (`"ffmpeg http://..."`, `"auto http://..."` or a bare URL).
pub fn extract_url(cmd: &str) -> Option<String> {
    cmd.split_whitespace()
        .find(|token| token.starts_with("http://") || token.starts_with("https://"))
        .map(str::to_string)
}

pub fn parse_expiry(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for format in ["%B %e, %Y", "%b %e, %Y", "%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    None
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    base.mul_f64(factor)
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
