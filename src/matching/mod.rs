//! Station directory matching
//!
//! Associates a channel name with an external station/EPG identifier. The
//! directory is a JSON file of station records loaded once at startup and
//! queried as a pure function: no I/O on the match path, deterministic
//! scoring, and a configurable floor below which no match is produced.
//! Manual overrides (`custom_epg_id`, `custom_name`) take precedence at
//! emission time and never reach this module.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;
use unidecode::unidecode;

const CALL_SIGN_BONUS: f64 = 0.15;
const COUNTRY_BONUS: f64 = 0.10;

/// One station in the external directory
#[derive(Debug, Clone, Deserialize)]
pub struct StationRecord {
    pub name: String,
    #[serde(default)]
    pub call_sign: String,
    #[serde(default)]
    pub station_id: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub logo_uri: String,
}

/// A successful match against the directory
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub name: String,
    pub station_id: String,
    pub call_sign: String,
    pub logo: String,
    pub score: f64,
    pub source: String,
}

/// The cached station dataset, indexed by country for cheap candidate
/// narrowing.
pub struct StationDirectory {
    stations: Vec<StationRecord>,
    by_country: HashMap<String, Vec<usize>>,
    threshold: f64,
}

impl StationDirectory {
    /// Load a JSON array of station records. A missing path yields an
    /// empty directory (matching disabled) rather than an error.
    pub fn load(path: &Path, threshold: f64) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::empty(threshold));
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading station directory {}", path.display()))?;
        let stations: Vec<StationRecord> = serde_json::from_str(&contents)
            .with_context(|| format!("parsing station directory {}", path.display()))?;
        info!("Loaded {} stations from {}", stations.len(), path.display());
        Ok(Self::new(stations, threshold))
    }

    pub fn new(stations: Vec<StationRecord>, threshold: f64) -> Self {
        let mut by_country: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, station) in stations.iter().enumerate() {
            if !station.country.is_empty() {
                by_country
                    .entry(station.country.to_uppercase())
                    .or_default()
                    .push(idx);
            }
        }
        Self {
            stations,
            by_country,
            threshold,
        }
    }

    pub fn empty(threshold: f64) -> Self {
        Self::new(Vec::new(), threshold)
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    /// Score every candidate and return the best match at or above the
    /// floor. Ties break on station name so repeated calls agree.
    pub fn match_name(&self, raw_name: &str, country: &str) -> Option<MatchResult> {
        let needle = normalize(raw_name);
        if needle.is_empty() || self.stations.is_empty() {
            return None;
        }

        let country_key = country.to_uppercase();
        let candidate_indexes: Vec<usize> = match self.by_country.get(&country_key) {
            Some(indexes) if !country_key.is_empty() => indexes.clone(),
            _ => (0..self.stations.len()).collect(),
        };

        let mut best: Option<(f64, &StationRecord)> = None;
        for idx in candidate_indexes {
            let station = &self.stations[idx];
            let score = self.score(&needle, &country_key, station);
            match best {
                Some((best_score, best_station)) => {
                    if score > best_score
                        || (score == best_score && station.name < best_station.name)
                    {
                        best = Some((score, station));
                    }
                }
                None => best = Some((score, station)),
            }
        }

        let (score, station) = best?;
        if score < self.threshold {
            return None;
        }
        Some(MatchResult {
            name: station.name.clone(),
            station_id: station.station_id.clone(),
            call_sign: station.call_sign.clone(),
            logo: station.logo_uri.clone(),
            score,
            source: "directory".to_string(),
        })
    }

    fn score(&self, needle: &str, country: &str, station: &StationRecord) -> f64 {
        let mut score = levenshtein_similarity(needle, &normalize(&station.name));

        if !station.call_sign.is_empty() {
            let call_sign = normalize(&station.call_sign);
            if !call_sign.is_empty() && needle.split_whitespace().any(|token| token == call_sign) {
                score += CALL_SIGN_BONUS;
            }
        }

        if !country.is_empty() && station.country.eq_ignore_ascii_case(country) {
            score += COUNTRY_BONUS;
        }

        score.min(1.0)
    }
}

/// Fold to uppercase ASCII alphanumeric tokens joined by single spaces.
fn normalize(value: &str) -> String {
    let folded = unidecode(value).to_uppercase();
    folded
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn levenshtein_similarity(s1: &str, s2: &str) -> f64 {
    let len1 = s1.chars().count();
    let len2 = s2.chars().count();
    let max_len = len1.max(len2);
    if max_len == 0 {
        return 1.0;
    }
    let distance = levenshtein_distance(s1, s2);
    1.0 - (distance as f64 / max_len as f64)
}

fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();
    let len1 = s1_chars.len();
    let len2 = s2_chars.len();

    let mut matrix = vec![vec![0usize; len2 + 1]; len1 + 1];
    for (i, row) in matrix.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    for i in 1..=len1 {
        for j in 1..=len2 {
            let cost = if s1_chars[i - 1] == s2_chars[j - 1] {
                0
            } else {
                1
            };
            matrix[i][j] = (matrix[i - 1][j] + 1)
                .min(matrix[i][j - 1] + 1)
                .min(matrix[i - 1][j - 1] + cost);
        }
    }

    matrix[len1][len2]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> StationDirectory {
        StationDirectory::new(
            vec![
                StationRecord {
                    name: "BBC One".into(),
                    call_sign: "BBC1".into(),
                    station_id: "24321".into(),
                    country: "UK".into(),
                    logo_uri: "http://logos/bbc1.png".into(),
                },
                StationRecord {
                    name: "BBC Two".into(),
                    call_sign: "BBC2".into(),
                    station_id: "24322".into(),
                    country: "UK".into(),
                    logo_uri: String::new(),
                },
                StationRecord {
                    name: "ZDF".into(),
                    call_sign: String::new(),
                    station_id: "30101".into(),
                    country: "DE".into(),
                    logo_uri: String::new(),
                },
            ],
            0.65,
        )
    }

    #[test]
    fn exact_name_matches_with_country_bonus() {
        let result = directory().match_name("BBC One", "UK").unwrap();
        assert_eq!(result.station_id, "24321");
        assert!(result.score >= 0.99);
    }

    #[test]
    fn below_floor_produces_no_match() {
        assert!(directory().match_name("Totally Different", "UK").is_none());
    }

    #[test]
    fn call_sign_token_adds_bonus() {
        let with = directory().match_name("BBC1 London", "UK");
        assert!(with.is_some());
        assert_eq!(with.unwrap().station_id, "24321");
    }

    #[test]
    fn unknown_country_falls_back_to_full_scan() {
        let result = directory().match_name("ZDF", "").unwrap();
        assert_eq!(result.station_id, "30101");
    }

    #[test]
    fn empty_directory_never_matches() {
        let dir = StationDirectory::empty(0.65);
        assert!(dir.match_name("BBC One", "UK").is_none());
    }

    #[test]
    fn match_is_deterministic() {
        let dir = directory();
        let a = dir.match_name("BBC One HD", "UK");
        let b = dir.match_name("BBC One HD", "UK");
        assert_eq!(a, b);
    }

    #[test]
    fn levenshtein_ratio_bounds() {
        assert!((levenshtein_similarity("ABC", "ABC") - 1.0).abs() < f64::EPSILON);
        assert!(levenshtein_similarity("ABC", "XYZ") < 0.01);
        assert!((levenshtein_similarity("", "") - 1.0).abs() < f64::EPSILON);
    }
}
