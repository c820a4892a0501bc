//! Tag and name normalization
//!
//! A pure, deterministic pass over raw channel names: extract structured
//! tags (resolution, video codec, country, audio, event, misc), detect
//! decorative header rows and RAW feeds, and produce a cleaned display
//! name. The engine ships no built-in patterns; the rule set arrives as
//! data from settings (`LABEL=PATTERN` lines, one per line).

use crate::config::Settings;
use regex::Regex;
use std::collections::HashSet;
use tracing::debug;
use unidecode::unidecode;

/// Compiled rule set for one extraction pass
pub struct TagRules {
    resolution: Vec<(String, Regex)>,
    video: Vec<(String, Regex)>,
    audio: Vec<(String, Regex)>,
    event: Vec<(String, Regex)>,
    misc: Vec<(String, Regex)>,
    header: Vec<Regex>,
    countries: HashSet<String>,
}

impl TagRules {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            resolution: parse_labeled(&settings.tag_resolution_patterns),
            video: parse_labeled(&settings.tag_video_codec_patterns),
            audio: parse_labeled(&settings.tag_audio_patterns),
            event: parse_list(&settings.tag_event_patterns),
            misc: parse_list(&settings.tag_misc_patterns),
            header: parse_plain(&settings.tag_header_patterns),
            countries: settings
                .tag_country_codes
                .split(',')
                .map(|c| c.trim().to_uppercase())
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }

    /// An empty rule set extracts nothing and only applies the structural
    /// header detection.
    pub fn empty() -> Self {
        Self {
            resolution: Vec::new(),
            video: Vec::new(),
            audio: Vec::new(),
            event: Vec::new(),
            misc: Vec::new(),
            header: Vec::new(),
            countries: HashSet::new(),
        }
    }
}

/// `LABEL=PATTERN` lines; invalid patterns are skipped, not fatal.
fn parse_labeled(value: &str) -> Vec<(String, Regex)> {
    value
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (label, pattern) = line.split_once('=')?;
            match compile(pattern) {
                Some(re) => Some((label.trim().to_string(), re)),
                None => None,
            }
        })
        .collect()
}

/// One pattern per line; the tag label is the pattern with regex syntax
/// stripped (`\bPPV\b` tags as `PPV`).
fn parse_list(value: &str) -> Vec<(String, Regex)> {
    value
        .lines()
        .filter_map(|line| {
            let pattern = line.trim();
            if pattern.is_empty() {
                return None;
            }
            compile(pattern).map(|re| (strip_pattern_syntax(pattern), re))
        })
        .collect()
}

fn parse_plain(value: &str) -> Vec<Regex> {
    value
        .lines()
        .filter_map(|line| compile(line.trim()))
        .collect()
}

fn compile(pattern: &str) -> Option<Regex> {
    if pattern.is_empty() {
        return None;
    }
    match Regex::new(&format!("(?i){pattern}")) {
        Ok(re) => Some(re),
        Err(err) => {
            debug!("Skipping uncompilable tag pattern '{pattern}': {err}");
            None
        }
    }
}

fn strip_pattern_syntax(pattern: &str) -> String {
    pattern
        .replace("\\b", "")
        .replace('\\', "")
        .trim()
        .to_string()
}

/// Result of one extraction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagExtract {
    pub clean_name: String,
    pub resolution: String,
    pub video_codec: String,
    pub country: String,
    pub audio_tags: Vec<String>,
    pub event_tags: Vec<String>,
    pub misc_tags: Vec<String>,
    pub is_header: bool,
    pub is_event: bool,
    pub is_raw: bool,
}

const DECORATIVE: &str = "#*✦┃★=~—┇│▌▐░▒▓■□◆◇-_.·•";

/// Extract tags from a raw channel name. Pure and deterministic; never
/// mutates its inputs.
pub fn extract(raw_name: &str, rules: &TagRules) -> TagExtract {
    let name = collapse_whitespace(raw_name.trim());
    if name.is_empty() {
        return TagExtract::default();
    }

    if is_header_name(&name, rules) {
        return TagExtract {
            clean_name: name,
            is_header: true,
            ..TagExtract::default()
        };
    }

    let folded = normalized_upper(&name);

    let mut removals: Vec<&Regex> = Vec::new();

    let mut resolution = String::new();
    for (label, re) in &rules.resolution {
        if re.is_match(&folded) {
            resolution = label.clone();
            removals.push(re);
            break;
        }
    }

    let mut video_codec = String::new();
    for (label, re) in &rules.video {
        if re.is_match(&folded) {
            video_codec = label.clone();
            removals.push(re);
            break;
        }
    }

    let mut audio_tags = Vec::new();
    for (label, re) in &rules.audio {
        if re.is_match(&folded) {
            audio_tags.push(label.clone());
            removals.push(re);
        }
    }

    let raw_re = raw_token_regex();
    let is_raw = raw_re.is_match(&folded) || name.contains('ᴿ');
    if is_raw {
        removals.push(raw_re);
    }

    let mut event_tags = Vec::new();
    for (label, re) in &rules.event {
        if re.is_match(&folded) {
            event_tags.push(label.clone());
            removals.push(re);
        }
    }
    event_tags.dedup();
    let is_event = !event_tags.is_empty();

    let mut misc_tags = Vec::new();
    for (label, re) in &rules.misc {
        if re.is_match(&folded) {
            misc_tags.push(label.clone());
            removals.push(re);
        }
    }
    misc_tags.dedup();

    let country = folded
        .split_whitespace()
        .find(|token| rules.countries.contains(*token))
        .map(str::to_string)
        .unwrap_or_default();

    let mut cleaned = name.clone();
    for re in removals {
        cleaned = re.replace_all(&cleaned, " ").into_owned();
    }
    if !country.is_empty() {
        if let Ok(re) = Regex::new(&format!(
            r"(?i)(^|[^A-Za-z0-9]){}($|[^A-Za-z0-9])",
            regex::escape(&country)
        )) {
            cleaned = re.replace_all(&cleaned, " ").into_owned();
        }
    }

    let cleaned = finalize_name(&cleaned, &resolution);

    TagExtract {
        clean_name: cleaned,
        resolution,
        video_codec,
        country,
        audio_tags,
        event_tags,
        misc_tags,
        is_header: false,
        is_event,
        is_raw,
    }
}

fn raw_token_regex() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bRAW\b").expect("raw token regex"))
}

/// ASCII-fold and uppercase, squashing punctuation runs to single spaces.
fn normalized_upper(name: &str) -> String {
    let folded = unidecode(name).to_uppercase();
    let mut out = String::with_capacity(folded.len());
    let mut last_space = false;
    for c in folded.chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '+' {
            out.push(c);
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim().to_string()
}

/// Header rows are decorative separators, not tunable channels: either a
/// configured framing pattern matches, both ends carry a decorative run,
/// or decoration dominates the name.
fn is_header_name(name: &str, rules: &TagRules) -> bool {
    for re in &rules.header {
        if re.is_match(name) {
            return true;
        }
    }

    let leading: String = name
        .chars()
        .take_while(|c| DECORATIVE.contains(*c) || c.is_whitespace())
        .filter(|c| !c.is_whitespace())
        .collect();
    let trailing: String = name
        .chars()
        .rev()
        .take_while(|c| DECORATIVE.contains(*c) || c.is_whitespace())
        .filter(|c| !c.is_whitespace())
        .collect();
    if leading.chars().count() >= 2 && !trailing.is_empty() {
        let trailing: String = trailing.chars().rev().collect();
        if leading == trailing || (leading.chars().count() >= 6 && trailing.chars().count() >= 6) {
            return true;
        }
    }

    // Fallback: mostly-decorative names are headers too
    let non_word: usize = name
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .count();
    let total = name.chars().filter(|c| !c.is_whitespace()).count();
    non_word >= 4 && total > 0 && non_word * 10 >= total * 3
}

fn finalize_name(cleaned: &str, resolution: &str) -> String {
    let stripped: String = cleaned
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || c == '+' || c == '.' {
                c
            } else {
                ' '
            }
        })
        .collect();
    let mut collapsed = collapse_whitespace(stripped.trim());

    // Drop a dangling resolution word the pattern pass left behind
    if !resolution.is_empty() {
        let upper = normalized_upper(&collapsed);
        if upper
            .split_whitespace()
            .last()
            .map(|last| last == resolution)
            .unwrap_or(false)
        {
            let words: Vec<&str> = collapsed.split_whitespace().collect();
            collapsed = words[..words.len().saturating_sub(1)].join(" ");
        }
    }

    collapsed
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
