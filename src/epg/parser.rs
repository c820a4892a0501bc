//! Streaming XMLTV parser
//!
//! Two-pass extraction over one quick-xml scan: `<channel>` elements with
//! all their display-name aliases, and `<programme>` elements with the
//! fields the store keeps. Malformed elements are skipped and counted,
//! never fatal; only an unreadable document errors.

use chrono::{FixedOffset, NaiveDateTime, TimeZone, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;

use crate::errors::EpgError;
use crate::models::{EpgChannelRecord, ProgrammeRow};

#[derive(Debug, Default)]
pub struct ParsedXmltv {
    pub channels: Vec<EpgChannelRecord>,
    pub programmes: Vec<ProgrammeRow>,
    /// Elements dropped at their boundary (missing ids, bad timestamps)
    pub skipped: usize,
}

pub fn parse_xmltv(content: &str, source_id: &str) -> Result<ParsedXmltv, EpgError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut out = ParsedXmltv::default();

    let mut current_channel: Option<EpgChannelRecord> = None;
    let mut current_programme: Option<ProgrammeBuilder> = None;
    let mut element_stack: Vec<String> = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let name = element_name(e);
                match name.as_str() {
                    "channel" => {
                        let attrs = attributes(e);
                        current_channel = Some(EpgChannelRecord {
                            source_id: source_id.to_string(),
                            channel_id: attrs.get("id").cloned().unwrap_or_default(),
                            lcn: attrs.get("lcn").cloned().unwrap_or_default(),
                            ..Default::default()
                        });
                    }
                    "programme" => {
                        let attrs = attributes(e);
                        current_programme = Some(ProgrammeBuilder {
                            channel: attrs.get("channel").cloned().unwrap_or_default(),
                            start: attrs.get("start").cloned().unwrap_or_default(),
                            stop: attrs.get("stop").cloned().unwrap_or_default(),
                            ..Default::default()
                        });
                    }
                    _ => {}
                }
                element_stack.push(name);
                text.clear();
            }
            Ok(Event::End(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let value = text.trim().to_string();

                match name.as_str() {
                    "channel" => {
                        if let Some(finished) = current_channel.take() {
                            if finished.channel_id.is_empty() {
                                out.skipped += 1;
                            } else {
                                out.channels.push(finished);
                            }
                        }
                    }
                    "programme" => {
                        if let Some(finished) = current_programme.take() {
                            match finished.build() {
                                Some(row) => out.programmes.push(row),
                                None => out.skipped += 1,
                            }
                        }
                    }
                    _ => {
                        if let Some(channel) = current_channel.as_mut() {
                            match name.as_str() {
                                "display-name" if !value.is_empty() => {
                                    if channel.display_name.is_empty() {
                                        channel.display_name = value.clone();
                                    }
                                    if !channel.names.contains(&value) {
                                        channel.names.push(value.clone());
                                    }
                                }
                                "lcn" if !value.is_empty() => channel.lcn = value.clone(),
                                _ => {}
                            }
                        }
                        if let Some(programme) = current_programme.as_mut() {
                            match name.as_str() {
                                "title" if programme.title.is_empty() => {
                                    programme.title = value.clone()
                                }
                                "desc" if programme.description.is_empty() => {
                                    programme.description = value.clone()
                                }
                                "sub-title" if programme.sub_title.is_empty() => {
                                    programme.sub_title = value.clone()
                                }
                                "category" if !value.is_empty() => {
                                    programme.categories.push(value.clone())
                                }
                                "episode-num" if programme.episode_num.is_empty() => {
                                    programme.episode_num = value.clone()
                                }
                                "value" if element_stack.iter().any(|e| e == "rating") => {
                                    if programme.rating.is_empty() {
                                        programme.rating = value.clone();
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                }

                element_stack.pop();
                text.clear();
            }
            Ok(Event::Empty(ref e)) => {
                let name = element_name(e);
                if name == "icon" {
                    let attrs = attributes(e);
                    if let Some(src) = attrs.get("src") {
                        if let Some(channel) = current_channel.as_mut() {
                            if channel.icon.is_empty() {
                                channel.icon = src.clone();
                            }
                        }
                        if let Some(programme) = current_programme.as_mut() {
                            if programme.icon.is_empty() {
                                programme.icon = src.clone();
                            }
                        }
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if let Ok(fragment) = e.unescape() {
                    text.push_str(&fragment);
                }
            }
            Ok(Event::CData(e)) => {
                if let Ok(fragment) = std::str::from_utf8(&e) {
                    text.push_str(fragment);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(EpgError::Parse(format!(
                    "XML error at byte {}: {e}",
                    reader.buffer_position()
                )))
            }
            _ => {}
        }
    }

    Ok(out)
}

#[derive(Debug, Default)]
struct ProgrammeBuilder {
    channel: String,
    start: String,
    stop: String,
    title: String,
    description: String,
    sub_title: String,
    categories: Vec<String>,
    episode_num: String,
    rating: String,
    icon: String,
}

impl ProgrammeBuilder {
    fn build(self) -> Option<ProgrammeRow> {
        if self.channel.is_empty() {
            return None;
        }
        let (start_ts, start) = parse_xmltv_time(&self.start)?;
        let (stop_ts, stop) = parse_xmltv_time(&self.stop)?;
        Some(ProgrammeRow {
            channel_id: self.channel,
            start,
            stop,
            start_ts,
            stop_ts,
            title: self.title,
            description: self.description,
            sub_title: self.sub_title,
            categories: self.categories.join(","),
            episode_num: self.episode_num,
            rating: self.rating,
            icon: self.icon,
            extra_json: String::new(),
        })
    }
}

fn element_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_string()
}

fn attributes(e: &BytesStart) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    for attr in e.attributes().flatten() {
        if let (Ok(key), Ok(value)) = (
            std::str::from_utf8(attr.key.as_ref()),
            attr.unescape_value(),
        ) {
            attrs.insert(key.to_string(), value.to_string());
        }
    }
    attrs
}

/// Parse `YYYYMMDDHHMMSS [±HHMM]` into a UTC epoch plus the normalized
/// UTC string the emitter writes back out.
pub fn parse_xmltv_time(value: &str) -> Option<(i64, String)> {
    let mut parts = value.split_whitespace();
    let stamp = parts.next()?;
    if stamp.len() < 14 {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(&stamp[..14], "%Y%m%d%H%M%S").ok()?;

    let utc = match parts.next() {
        Some(zone) if zone.len() >= 5 => {
            let sign = match zone.as_bytes()[0] {
                b'+' => 1,
                b'-' => -1,
                _ => return None,
            };
            let hours: i32 = zone.get(1..3)?.parse().ok()?;
            let minutes: i32 = zone.get(3..5)?.parse().ok()?;
            let offset = FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))?;
            offset
                .from_local_datetime(&naive)
                .single()?
                .with_timezone(&Utc)
        }
        _ => Utc.from_utc_datetime(&naive),
    };

    let epoch = utc.timestamp();
    Some((epoch, format!("{} +0000", utc.format("%Y%m%d%H%M%S"))))
}

/// Epoch → XMLTV timestamp string, UTC.
pub fn format_xmltv_time(epoch: i64) -> String {
    match chrono::DateTime::<Utc>::from_timestamp(epoch, 0) {
        Some(dt) => format!("{} +0000", dt.format("%Y%m%d%H%M%S")),
        None => String::new(),
    }
}
