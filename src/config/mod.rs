//! Configuration handling
//!
//! Two layers: process-level settings resolved from environment variables
//! ([`AppContext`]), and the operator-editable `config.json`
//! ([`ConfigFile`]) holding settings, portals and their MACs. The JSON file
//! is read-modify-written atomically; unknown keys are preserved through
//! `#[serde(flatten)]` maps so collaborator-owned settings survive a
//! rewrite.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Accept `true`/`false`, `"true"`/`"false"`, or 0/1
fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::String(s) => s.eq_ignore_ascii_case("true"),
        serde_json::Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        _ => false,
    })
}

fn flexible_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n.as_u64().unwrap_or(0) as u32,
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

fn flexible_i32<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0) as i32,
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

fn flexible_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    })
}

/// Process-level settings resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub bind_host: String,
    pub port: u16,
    /// Hostname baked into generated playlist/play URLs; `None` falls back
    /// to the request's Host header.
    pub public_host: Option<String>,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub config_path: PathBuf,
    pub db_path: PathBuf,
    pub timezone: String,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Hours; overrides the settings value when set
    pub epg_refresh_interval: Option<f64>,
    /// Hours; 0 disables the channel loop; overrides settings when set
    pub channel_refresh_interval: Option<f64>,
}

impl AppContext {
    pub fn from_env() -> Self {
        let data_dir = PathBuf::from(env_or("DATA_DIR", "./data"));
        let log_dir = PathBuf::from(env_or("LOG_DIR", "./logs"));
        let config_path = std::env::var("CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("config.json"));
        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("channels.db"));

        Self {
            bind_host: env_or("BIND_HOST", "0.0.0.0"),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8001),
            public_host: std::env::var("PUBLIC_HOST").ok().filter(|v| !v.is_empty()),
            data_dir,
            log_dir,
            config_path,
            db_path,
            timezone: env_or("TZ", "UTC"),
            ffmpeg_path: env_or("FFMPEG", "ffmpeg"),
            ffprobe_path: env_or("FFPROBE", "ffprobe"),
            epg_refresh_interval: std::env::var("EPG_REFRESH_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok()),
            channel_refresh_interval: std::env::var("CHANNEL_REFRESH_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    pub fn epg_sources_dir(&self) -> PathBuf {
        self.data_dir.join("epg_sources")
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// A custom XMLTV source declared in settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomEpgSource {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_custom_interval", deserialize_with = "flexible_f64")]
    pub interval: f64,
    #[serde(default = "default_true", deserialize_with = "flexible_bool")]
    pub enabled: bool,
}

fn default_custom_interval() -> f64 {
    24.0
}

fn default_true() -> bool {
    true
}

/// Typed view over the settings object. Keys keep the historical
/// space-separated names; anything this struct does not know about rides
/// along in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "stream method", default = "d_stream_method")]
    pub stream_method: String,
    #[serde(rename = "output format", default = "d_output_format")]
    pub output_format: String,
    #[serde(rename = "ffmpeg command", default = "d_ffmpeg_command")]
    pub ffmpeg_command: String,
    #[serde(
        rename = "ffmpeg timeout",
        default = "d_ffmpeg_timeout",
        deserialize_with = "flexible_u32"
    )]
    pub ffmpeg_timeout: u32,
    #[serde(
        rename = "epg refresh interval",
        default = "d_epg_interval",
        deserialize_with = "flexible_f64"
    )]
    pub epg_refresh_interval: f64,
    #[serde(
        rename = "channel refresh interval",
        default = "d_channel_interval",
        deserialize_with = "flexible_f64"
    )]
    pub channel_refresh_interval: f64,
    #[serde(
        rename = "epg future hours",
        default = "d_epg_future",
        deserialize_with = "flexible_f64"
    )]
    pub epg_future_hours: f64,
    #[serde(
        rename = "epg past hours",
        default = "d_epg_past",
        deserialize_with = "flexible_f64"
    )]
    pub epg_past_hours: f64,
    #[serde(
        rename = "epg retention hours",
        default = "d_epg_retention",
        deserialize_with = "flexible_f64"
    )]
    pub epg_retention_hours: f64,
    #[serde(
        rename = "channel retention hours",
        default = "d_channel_retention",
        deserialize_with = "flexible_f64"
    )]
    pub channel_retention_hours: f64,
    #[serde(rename = "epg custom sources", default)]
    pub epg_custom_sources: Vec<CustomEpgSource>,
    #[serde(
        rename = "try all macs",
        default = "default_true",
        deserialize_with = "flexible_bool"
    )]
    pub try_all_macs: bool,
    #[serde(rename = "tag country codes", default = "d_tag_countries")]
    pub tag_country_codes: String,
    #[serde(rename = "tag resolution patterns", default = "d_tag_resolution")]
    pub tag_resolution_patterns: String,
    #[serde(rename = "tag video codec patterns", default = "d_tag_video")]
    pub tag_video_codec_patterns: String,
    #[serde(rename = "tag audio patterns", default = "d_tag_audio")]
    pub tag_audio_patterns: String,
    #[serde(rename = "tag event patterns", default = "d_tag_event")]
    pub tag_event_patterns: String,
    #[serde(rename = "tag misc patterns", default = "d_tag_misc")]
    pub tag_misc_patterns: String,
    #[serde(rename = "tag header patterns", default = "d_tag_header")]
    pub tag_header_patterns: String,
    #[serde(rename = "station directory", default)]
    pub station_directory: String,
    #[serde(
        rename = "match threshold",
        default = "d_match_threshold",
        deserialize_with = "flexible_f64"
    )]
    pub match_threshold: f64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn d_stream_method() -> String {
    "ffmpeg".into()
}
fn d_output_format() -> String {
    "mpegts".into()
}
fn d_ffmpeg_command() -> String {
    "-re -http_proxy <proxy> -timeout <timeout> -i <url> -map 0 -codec copy -f mpegts \
     -flush_packets 0 -fflags +nobuffer -flags low_delay -strict experimental \
     -analyzeduration 0 -probesize 32 -copyts pipe:"
        .into()
}
fn d_ffmpeg_timeout() -> u32 {
    5
}
fn d_epg_interval() -> f64 {
    0.5
}
fn d_channel_interval() -> f64 {
    24.0
}
fn d_epg_future() -> f64 {
    24.0
}
fn d_epg_past() -> f64 {
    2.0
}
fn d_epg_retention() -> f64 {
    48.0
}
fn d_channel_retention() -> f64 {
    72.0
}
fn d_match_threshold() -> f64 {
    0.65
}
fn d_tag_countries() -> String {
    "AF,AL,ALB,AR,AT,AU,BE,BG,BR,CA,CH,CN,CZ,DE,DK,EE,ES,FI,FR,GR,HK,HR,HU,IE,IL,IN,IR,IS,IT,\
     JO,JP,KR,KW,LAT,LB,LT,LU,LV,MA,MK,MO,MX,MXC,NL,NO,NZ,PL,PT,RO,RS,RU,SA,SE,SG,SI,SK,TR,UA,\
     UK,US,USA"
        .into()
}
fn d_tag_resolution() -> String {
    "8K=\\b(8K|4320P)\\b\nUHD=\\b(UHD|ULTRA|4K\\+?|2160P)\\b\nFHD=\\b(FHD|1080P)\\b\n\
     HD=\\b(HD|720P)\\b\nSD=\\b(SD|576P|480P)\\b"
        .into()
}
fn d_tag_video() -> String {
    "AV1=\\bAV1\\b\nVP9=\\bVP9\\b\nHEVC=\\b(HEVC|H\\.?265|H265)\\b\nH264=\\b(H\\.?264|H264|AVC)\\b\n\
     MPEG2=\\bMPEG[- ]?2\\b"
        .into()
}
fn d_tag_audio() -> String {
    "AAC=\\bAAC\\b\nAC3=\\bAC3\\b\nEAC3=\\bEAC3\\b\nDDP=\\b(DD\\+|DDP)\\b\nDTS=\\bDTS\\b\n\
     ATMOS=\\bATMOS\\b\n7.1=\\b7\\.1\\b\n5.1=\\b5\\.1\\b\n2.0=\\b2\\.0\\b"
        .into()
}
fn d_tag_event() -> String {
    "\\bPPV\\b\n\\bEVENT\\b\n\\bLIVE EVENT\\b\n\\bLIVE-EVENT\\b\n\\bNO EVENT\\b\n\
     \\bNO EVENT STREAMING\\b\n\\bMATCH TIME\\b"
        .into()
}
fn d_tag_misc() -> String {
    "\\bSAT\\b\n\\bBAR\\b".into()
}
fn d_tag_header() -> String {
    "^\\s*[#*✦┃★=~—]{2,}.*[#*✦┃★=~—]{2,}\\s*$".into()
}

impl Default for Settings {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("settings defaults")
    }
}

/// A MAC credential attached to a portal
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MacAccount {
    /// Expiry date as reported by the portal, `None` when unknown
    #[serde(default)]
    pub expiry: Option<String>,
    #[serde(default, deserialize_with = "flexible_u32")]
    pub watchdog_timeout: u32,
    #[serde(default, deserialize_with = "flexible_u32")]
    pub playback_limit: u32,
    /// Unix timestamp of the last successful profile fetch
    #[serde(default)]
    pub last_profile_fetch: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MacAccount {
    /// Parse the stored expiry string; portals report a handful of formats.
    pub fn expiry_date(&self) -> Option<NaiveDate> {
        let raw = self.expiry.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        for format in ["%Y-%m-%d", "%B %e, %Y", "%b %e, %Y", "%d.%m.%Y", "%d/%m/%Y"] {
            if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
                return Some(date);
            }
        }
        None
    }
}

/// One portal entry in config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_true", deserialize_with = "flexible_bool")]
    pub enabled: bool,
    #[serde(default)]
    pub proxy: String,
    #[serde(
        rename = "streams per mac",
        default = "d_streams_per_mac",
        deserialize_with = "flexible_u32"
    )]
    pub streams_per_mac: u32,
    /// Minutes added to portal-supplied programme times at emission
    #[serde(rename = "epg offset", default, deserialize_with = "flexible_i32")]
    pub epg_offset: i32,
    #[serde(
        rename = "fetch epg",
        default = "default_true",
        deserialize_with = "flexible_bool"
    )]
    pub fetch_epg: bool,
    #[serde(
        rename = "auto normalize names",
        default,
        deserialize_with = "flexible_bool"
    )]
    pub auto_normalize_names: bool,
    #[serde(rename = "auto match", default, deserialize_with = "flexible_bool")]
    pub auto_match: bool,
    #[serde(default)]
    pub macs: BTreeMap<String, MacAccount>,
    #[serde(default)]
    pub selected_genres: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn d_streams_per_mac() -> u32 {
    1
}

impl Default for PortalConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("portal defaults")
    }
}

/// The whole config.json document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub portals: BTreeMap<String, PortalConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Process-wide configuration store: explicit singleton, injected where
/// needed, guarded by an RwLock because admin endpoints mutate portals at
/// runtime.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    inner: Arc<RwLock<ConfigFile>>,
}

impl ConfigStore {
    /// Load config.json, creating it with defaults when missing. A
    /// corrupt file is moved aside and replaced, never silently clobbered.
    pub fn load(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }

        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            match serde_json::from_str::<ConfigFile>(&contents) {
                Ok(parsed) => parsed,
                Err(err) => {
                    let backup = path.with_extension(format!(
                        "corrupt.{}",
                        chrono::Utc::now().format("%Y%m%d%H%M%S")
                    ));
                    warn!(
                        "Config file {} is unreadable ({}), moving to {}",
                        path.display(),
                        err,
                        backup.display()
                    );
                    std::fs::rename(path, &backup).ok();
                    ConfigFile::default()
                }
            }
        } else {
            ConfigFile::default()
        };

        let store = Self {
            path: path.to_path_buf(),
            inner: Arc::new(RwLock::new(config)),
        };
        // Rewrite immediately so coerced defaults land on disk
        store.save()?;
        Ok(store)
    }

    /// In-memory store for tests
    pub fn ephemeral(config: ConfigFile) -> Self {
        Self {
            path: PathBuf::from("/dev/null"),
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn snapshot(&self) -> ConfigFile {
        self.inner.read().expect("config lock poisoned").clone()
    }

    pub fn settings(&self) -> Settings {
        self.inner
            .read()
            .expect("config lock poisoned")
            .settings
            .clone()
    }

    pub fn portal(&self, portal_id: &str) -> Option<PortalConfig> {
        self.inner
            .read()
            .expect("config lock poisoned")
            .portals
            .get(portal_id)
            .cloned()
    }

    pub fn portals(&self) -> BTreeMap<String, PortalConfig> {
        self.inner
            .read()
            .expect("config lock poisoned")
            .portals
            .clone()
    }

    /// Mutate the config under the write lock and persist the result.
    pub fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut ConfigFile),
    {
        {
            let mut guard = self.inner.write().expect("config lock poisoned");
            mutate(&mut guard);
        }
        self.save()
    }

    /// Best-effort update of one MAC record (profile/expiry refresh paths).
    pub fn update_mac<F>(&self, portal_id: &str, mac: &str, mutate: F)
    where
        F: FnOnce(&mut MacAccount),
    {
        let result = self.update(|config| {
            if let Some(portal) = config.portals.get_mut(portal_id) {
                if let Some(account) = portal.macs.get_mut(mac) {
                    mutate(account);
                }
            }
        });
        if let Err(err) = result {
            warn!("Failed to persist MAC update for {portal_id}/{mac}: {err}");
        }
    }

    fn save(&self) -> Result<()> {
        if self.path.as_os_str() == "/dev/null" {
            return Ok(());
        }
        let contents = {
            let guard = self.inner.read().expect("config lock poisoned");
            serde_json::to_string_pretty(&*guard)?
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)
            .with_context(|| format!("writing config to {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing config at {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults_apply() {
        let settings = Settings::default();
        assert_eq!(settings.stream_method, "ffmpeg");
        assert_eq!(settings.ffmpeg_timeout, 5);
        assert!((settings.channel_refresh_interval - 24.0).abs() < f64::EPSILON);
        assert!(settings.try_all_macs);
    }

    #[test]
    fn portal_config_coerces_legacy_string_booleans() {
        let portal: PortalConfig = serde_json::from_value(serde_json::json!({
            "name": "Test",
            "url": "http://portal.example/c/",
            "enabled": "true",
            "streams per mac": "2",
            "fetch epg": "false",
        }))
        .unwrap();
        assert!(portal.enabled);
        assert_eq!(portal.streams_per_mac, 2);
        assert!(!portal.fetch_epg);
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let raw = serde_json::json!({
            "settings": {"stream method": "ffmpeg", "hdhr tuners": 10},
            "portals": {
                "p1": {
                    "name": "P1",
                    "url": "http://x/c/",
                    "portal code": "abc",
                    "macs": {"00:1A:79:00:00:01": {"expiry": "2026-01-01", "note": "kept"}}
                }
            },
            "custom top level": true
        });
        let parsed: ConfigFile = serde_json::from_value(raw).unwrap();
        let emitted = serde_json::to_value(&parsed).unwrap();
        assert_eq!(emitted["settings"]["hdhr tuners"], 10);
        assert_eq!(emitted["portals"]["p1"]["portal code"], "abc");
        assert_eq!(
            emitted["portals"]["p1"]["macs"]["00:1A:79:00:00:01"]["note"],
            "kept"
        );
        assert_eq!(emitted["custom top level"], true);
    }

    #[test]
    fn mac_expiry_parses_common_formats() {
        let mut account = MacAccount {
            expiry: Some("2026-03-01".into()),
            ..Default::default()
        };
        assert_eq!(account.expiry_date(), NaiveDate::from_ymd_opt(2026, 3, 1));
        account.expiry = Some("June 5, 2026".into());
        assert_eq!(account.expiry_date(), NaiveDate::from_ymd_opt(2026, 6, 5));
        account.expiry = Some("garbage".into());
        assert_eq!(account.expiry_date(), None);
    }
}
