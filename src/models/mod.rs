//! Shared data models
//!
//! Portal payload structs are deliberately strict-but-tolerant: optional
//! fields are nullable, unknown fields are ignored, and numeric ids that
//! some portals send as strings (and others as numbers) funnel through
//! [`string_or_number`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a JSON value that may be a string, integer or float into a
/// `String`. Stalker portals are not consistent about id/number types.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.map(|v| match v {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }))
}

/// A channel as returned by the portal's channel listing
#[derive(Debug, Clone, Deserialize)]
pub struct RawChannel {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub number: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub tv_genre_id: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub cmd: Option<String>,
}

/// A genre row from the portal
#[derive(Debug, Clone, Deserialize)]
pub struct RawGenre {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: String,
}

/// Account profile reported by the portal for a MAC
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MacProfile {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub watchdog_timeout: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub playback_limit: Option<String>,
    #[serde(default)]
    pub status: Option<i64>,
}

impl MacProfile {
    pub fn watchdog_timeout_seconds(&self) -> u32 {
        self.watchdog_timeout
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn playback_limit_value(&self) -> u32 {
        self.playback_limit
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

/// One programme entry from the portal's JSON EPG
#[derive(Debug, Clone, Deserialize)]
pub struct RawProgramme {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub start_timestamp: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub stop_timestamp: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub descr: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

/// Portal EPG payload: channel id → programme list
pub type RawEpg = HashMap<String, Vec<RawProgramme>>;

/// A channel row in the catalog store
#[derive(Debug, Clone, Default)]
pub struct ChannelRecord {
    pub portal_id: String,
    pub channel_id: String,
    pub name: String,
    pub number: String,
    pub genre: String,
    pub genre_id: String,
    pub logo: String,
    pub cmd: String,
    pub auto_name: String,
    pub display_name: String,
    pub resolution: String,
    pub video_codec: String,
    pub country: String,
    pub audio_tags: String,
    pub event_tags: String,
    pub misc_tags: String,
    pub custom_name: String,
    pub custom_number: String,
    pub custom_genre: String,
    pub custom_epg_id: String,
    pub matched_name: String,
    pub matched_source: String,
    pub matched_station_id: String,
    pub matched_call_sign: String,
    pub matched_logo: String,
    pub matched_score: Option<f64>,
    pub is_header: bool,
    pub is_event: bool,
    pub is_raw: bool,
    pub enabled: bool,
    pub available_macs: Vec<String>,
    pub alternate_ids: Vec<String>,
    pub channel_hash: String,
    pub missing_since: Option<DateTime<Utc>>,
}

impl ChannelRecord {
    /// custom > matched > auto > raw name
    pub fn effective_display_name(&self) -> &str {
        [
            &self.custom_name,
            &self.matched_name,
            &self.auto_name,
            &self.name,
        ]
        .into_iter()
        .find(|v| !v.is_empty())
        .map(String::as_str)
        .unwrap_or("")
    }

    /// custom_epg_id > matched_station_id > stable raw name
    pub fn effective_epg_id(&self) -> &str {
        [&self.custom_epg_id, &self.matched_station_id, &self.name]
            .into_iter()
            .find(|v| !v.is_empty())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn effective_number(&self) -> &str {
        if self.custom_number.is_empty() {
            &self.number
        } else {
            &self.custom_number
        }
    }

    pub fn effective_genre(&self) -> &str {
        if self.custom_genre.is_empty() {
            &self.genre
        } else {
            &self.custom_genre
        }
    }
}

/// A group (portal-native category) row
#[derive(Debug, Clone)]
pub struct GroupRecord {
    pub portal_id: String,
    pub genre_id: String,
    pub name: String,
    pub channel_count: i64,
    pub active: bool,
}

/// Aggregate counters recomputed at the end of each refresh
#[derive(Debug, Clone, Default, Serialize)]
pub struct PortalStats {
    pub total_channels: i64,
    pub active_channels: i64,
    pub total_groups: i64,
    pub active_groups: i64,
}

/// Outcome of one `refresh_portal` run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshStats {
    pub channels_seen: usize,
    pub imported: usize,
    pub updated: usize,
    pub skipped: usize,
    pub merged: usize,
    pub soft_deleted: usize,
    pub hard_deleted: usize,
    pub macs_failed: usize,
}

/// An EPG source row in the catalog store
#[derive(Debug, Clone, Serialize)]
pub struct EpgSourceRecord {
    pub source_id: String,
    pub name: String,
    pub url: String,
    pub source_type: EpgSourceType,
    pub enabled: bool,
    pub interval_hours: f64,
    pub last_fetch: Option<i64>,
    pub last_refresh: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpgSourceType {
    Portal,
    Custom,
}

impl EpgSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpgSourceType::Portal => "portal",
            EpgSourceType::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "portal" => EpgSourceType::Portal,
            _ => EpgSourceType::Custom,
        }
    }
}

/// A channel known to an EPG source
#[derive(Debug, Clone, Default)]
pub struct EpgChannelRecord {
    pub source_id: String,
    pub channel_id: String,
    pub display_name: String,
    pub icon: String,
    pub lcn: String,
    /// All display-name aliases carried by the source
    pub names: Vec<String>,
}

/// One programme row in a per-source programme DB
#[derive(Debug, Clone, Default)]
pub struct ProgrammeRow {
    pub channel_id: String,
    pub start: String,
    pub stop: String,
    pub start_ts: i64,
    pub stop_ts: i64,
    pub title: String,
    pub description: String,
    pub sub_title: String,
    pub categories: String,
    pub episode_num: String,
    pub rating: String,
    pub icon: String,
    pub extra_json: String,
}

/// A live stream session, as exposed by `/streaming`
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    #[serde(skip)]
    pub portal_id: String,
    pub portal_name: String,
    pub channel_id: String,
    pub channel_name: String,
    pub mac: String,
    pub client: String,
    pub start_time: DateTime<Utc>,
}

/// MAC candidate handed to the scheduler
#[derive(Debug, Clone)]
pub struct MacCandidate {
    pub mac: String,
    pub watchdog_timeout: u32,
    pub playback_limit: u32,
    pub expiry: Option<NaiveDate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_channel_accepts_numeric_and_string_ids() {
        let numeric: RawChannel =
            serde_json::from_str(r#"{"id": 42, "name": "Test", "number": 7}"#).unwrap();
        assert_eq!(numeric.id, "42");
        assert_eq!(numeric.number.as_deref(), Some("7"));

        let stringy: RawChannel =
            serde_json::from_str(r#"{"id": "42", "name": "Test", "cmd": null}"#).unwrap();
        assert_eq!(stringy.id, "42");
        assert!(stringy.cmd.is_none());
    }

    #[test]
    fn raw_channel_ignores_unknown_fields() {
        let ch: RawChannel = serde_json::from_str(
            r#"{"id": 1, "name": "A", "xmltv_id": "x", "censored": 0, "fav": false}"#,
        )
        .unwrap();
        assert_eq!(ch.name, "A");
    }

    #[test]
    fn effective_name_chain() {
        let mut ch = ChannelRecord {
            name: "RAW NAME HD".into(),
            ..Default::default()
        };
        assert_eq!(ch.effective_display_name(), "RAW NAME HD");
        ch.auto_name = "Raw Name".into();
        assert_eq!(ch.effective_display_name(), "Raw Name");
        ch.matched_name = "Raw Name Intl".into();
        assert_eq!(ch.effective_display_name(), "Raw Name Intl");
        ch.custom_name = "My Name".into();
        assert_eq!(ch.effective_display_name(), "My Name");
    }

    #[test]
    fn effective_epg_id_chain() {
        let mut ch = ChannelRecord {
            name: "BBC One".into(),
            ..Default::default()
        };
        assert_eq!(ch.effective_epg_id(), "BBC One");
        ch.matched_station_id = "12345".into();
        assert_eq!(ch.effective_epg_id(), "12345");
        ch.custom_epg_id = "bbc1.uk".into();
        assert_eq!(ch.effective_epg_id(), "bbc1.uk");
    }
}
