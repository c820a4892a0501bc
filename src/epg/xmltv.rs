//! Merged XMLTV emission
//!
//! Joins enabled channels with the per-source programme stores into one
//! guide document. Emission is streamed: fragments go out through a
//! channel-backed body as they are produced, so a large guide never fully
//! materializes in memory.

use anyhow::Result;
use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::ConfigStore;
use crate::database::Database;
use crate::epg::parser::format_xmltv_time;
use crate::epg::store::ProgrammeStore;

const FLUSH_THRESHOLD: usize = 32 * 1024;

/// One emission target: a programme-store channel id mapped back to the
/// guide id it must be published under, with the owning portal's offset.
struct ChannelBinding {
    store_channel_id: String,
    epg_id: String,
    offset_minutes: i64,
}

/// Build the guide as a byte stream suitable for a chunked HTTP body.
pub fn xmltv_stream(
    database: Database,
    config: ConfigStore,
    sources_dir: PathBuf,
) -> impl Stream<Item = std::result::Result<Bytes, std::io::Error>> {
    let (tx, rx) = mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        if let Err(err) = emit(database, config, sources_dir, tx).await {
            error!("XMLTV emission failed: {err}");
        }
    });
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok(chunk), rx))
    })
}

/// Convenience for tests and one-shot callers: the whole document.
pub async fn emit_to_string(
    database: Database,
    config: ConfigStore,
    sources_dir: PathBuf,
) -> Result<String> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(16);
    let task = tokio::spawn(emit(database, config, sources_dir, tx));
    let mut out = Vec::new();
    while let Some(chunk) = rx.recv().await {
        out.extend_from_slice(&chunk);
    }
    task.await??;
    Ok(String::from_utf8(out)?)
}

async fn emit(
    database: Database,
    config: ConfigStore,
    sources_dir: PathBuf,
    tx: mpsc::Sender<Bytes>,
) -> Result<()> {
    let settings = config.settings();
    let portals = config.portals();
    let now = Utc::now().timestamp();
    let past_cutoff = now - (settings.epg_past_hours * 3600.0) as i64;
    let future_cutoff = now + (settings.epg_future_hours * 3600.0) as i64;

    let channels = database.list_enabled_channels().await?;

    let mut writer = Writer::new(Vec::with_capacity(FLUSH_THRESHOLD * 2));
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    let mut tv = BytesStart::new("tv");
    tv.push_attribute(("generator-info-name", "stalker-proxy"));
    writer.write_event(Event::Start(tv))?;

    // Channel elements, one per distinct effective EPG id, while
    // collecting which source serves which guide id.
    let mut seen: HashSet<String> = HashSet::new();
    let mut per_source: BTreeMap<String, Vec<ChannelBinding>> = BTreeMap::new();

    for channel in &channels {
        let epg_id = channel.effective_epg_id().to_string();
        if epg_id.is_empty() || !seen.insert(epg_id.clone()) {
            continue;
        }

        let offset_minutes = portals
            .get(&channel.portal_id)
            .map(|p| i64::from(p.epg_offset))
            .unwrap_or(0);

        // Resolution order: verbatim id in a source, case-folded alias,
        // then the owning portal's own guide store.
        let (source_id, store_channel_id, resolved_icon, resolved_lcn) =
            match database.resolve_epg_id(&epg_id).await? {
                Some(hit) => (hit.source_id, hit.channel_id, hit.icon, hit.lcn),
                None => (
                    channel.portal_id.clone(),
                    epg_id.clone(),
                    String::new(),
                    String::new(),
                ),
            };

        let mut element = BytesStart::new("channel");
        element.push_attribute(("id", epg_id.as_str()));
        writer.write_event(Event::Start(element))?;

        writer.write_event(Event::Start(BytesStart::new("display-name")))?;
        writer.write_event(Event::Text(BytesText::new(
            channel.effective_display_name(),
        )))?;
        writer.write_event(Event::End(BytesEnd::new("display-name")))?;

        let icon = if channel.logo.is_empty() {
            resolved_icon
        } else {
            channel.logo.clone()
        };
        if !icon.is_empty() {
            let mut icon_element = BytesStart::new("icon");
            icon_element.push_attribute(("src", icon.as_str()));
            writer.write_event(Event::Empty(icon_element))?;
        }

        let lcn = if channel.effective_number().is_empty() {
            resolved_lcn
        } else {
            channel.effective_number().to_string()
        };
        if !lcn.is_empty() {
            writer.write_event(Event::Start(BytesStart::new("lcn")))?;
            writer.write_event(Event::Text(BytesText::new(&lcn)))?;
            writer.write_event(Event::End(BytesEnd::new("lcn")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("channel")))?;
        if !flush_if_due(&mut writer, &tx).await {
            return Ok(());
        }

        per_source
            .entry(source_id)
            .or_default()
            .push(ChannelBinding {
                store_channel_id,
                epg_id,
                offset_minutes,
            });
    }

    // Programme elements, source by source.
    for (source_id, bindings) in per_source {
        let store = match ProgrammeStore::open(&sources_dir, &source_id).await {
            Ok(store) => store,
            Err(err) => {
                debug!("No programme store for source {source_id}: {err}");
                continue;
            }
        };

        let mut id_map: HashMap<&str, Vec<&ChannelBinding>> = HashMap::new();
        for binding in &bindings {
            id_map
                .entry(binding.store_channel_id.as_str())
                .or_default()
                .push(binding);
        }
        let ids: Vec<String> = id_map.keys().map(|id| id.to_string()).collect();

        let rows = store.query_range(&ids, past_cutoff, future_cutoff).await?;
        for row in rows {
            let Some(bindings) = id_map.get(row.channel_id.as_str()) else {
                continue;
            };
            for binding in bindings {
                let start = format_xmltv_time(row.start_ts + binding.offset_minutes * 60);
                let stop = format_xmltv_time(row.stop_ts + binding.offset_minutes * 60);

                let mut element = BytesStart::new("programme");
                element.push_attribute(("channel", binding.epg_id.as_str()));
                element.push_attribute(("start", start.as_str()));
                element.push_attribute(("stop", stop.as_str()));
                writer.write_event(Event::Start(element))?;

                writer.write_event(Event::Start(BytesStart::new("title")))?;
                writer.write_event(Event::Text(BytesText::new(&row.title)))?;
                writer.write_event(Event::End(BytesEnd::new("title")))?;

                if !row.sub_title.is_empty() {
                    writer.write_event(Event::Start(BytesStart::new("sub-title")))?;
                    writer.write_event(Event::Text(BytesText::new(&row.sub_title)))?;
                    writer.write_event(Event::End(BytesEnd::new("sub-title")))?;
                }
                if !row.description.is_empty() {
                    writer.write_event(Event::Start(BytesStart::new("desc")))?;
                    writer.write_event(Event::Text(BytesText::new(&row.description)))?;
                    writer.write_event(Event::End(BytesEnd::new("desc")))?;
                }
                for category in row.categories.split(',').filter(|c| !c.is_empty()) {
                    writer.write_event(Event::Start(BytesStart::new("category")))?;
                    writer.write_event(Event::Text(BytesText::new(category)))?;
                    writer.write_event(Event::End(BytesEnd::new("category")))?;
                }
                if !row.episode_num.is_empty() {
                    writer.write_event(Event::Start(BytesStart::new("episode-num")))?;
                    writer.write_event(Event::Text(BytesText::new(&row.episode_num)))?;
                    writer.write_event(Event::End(BytesEnd::new("episode-num")))?;
                }
                if !row.rating.is_empty() {
                    writer.write_event(Event::Start(BytesStart::new("rating")))?;
                    writer.write_event(Event::Start(BytesStart::new("value")))?;
                    writer.write_event(Event::Text(BytesText::new(&row.rating)))?;
                    writer.write_event(Event::End(BytesEnd::new("value")))?;
                    writer.write_event(Event::End(BytesEnd::new("rating")))?;
                }
                if !row.icon.is_empty() {
                    let mut icon_element = BytesStart::new("icon");
                    icon_element.push_attribute(("src", row.icon.as_str()));
                    writer.write_event(Event::Empty(icon_element))?;
                }

                writer.write_event(Event::End(BytesEnd::new("programme")))?;
            }
            if !flush_if_due(&mut writer, &tx).await {
                return Ok(());
            }
        }
    }

    writer.write_event(Event::End(BytesEnd::new("tv")))?;
    let remainder = std::mem::take(writer.get_mut());
    if !remainder.is_empty() {
        let _ = tx.send(Bytes::from(remainder)).await;
    }
    Ok(())
}

/// Ship the buffer once it passes the threshold. Returns false when the
/// consumer went away — a client disconnect, not an error.
async fn flush_if_due(writer: &mut Writer<Vec<u8>>, tx: &mpsc::Sender<Bytes>) -> bool {
    if writer.get_ref().len() >= FLUSH_THRESHOLD {
        let chunk = std::mem::take(writer.get_mut());
        if tx.send(Bytes::from(chunk)).await.is_err() {
            debug!("Guide consumer disconnected mid-emission");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::test_config;
    use crate::database::channels::upsert_channel;
    use crate::database::test_database;
    use crate::epg::parser::parse_xmltv;
    use crate::models::{ChannelRecord, EpgSourceRecord, EpgSourceType, ProgrammeRow};

    async fn seed_channel(db: &Database, portal: &str, id: &str, name: &str, custom_epg: &str) {
        {
            let mut conn = db.pool().acquire().await.unwrap();
            let rec = ChannelRecord {
                portal_id: portal.into(),
                channel_id: id.into(),
                name: name.into(),
                number: "1".into(),
                enabled: true,
                channel_hash: "h".into(),
                ..Default::default()
            };
            upsert_channel(&mut conn, &rec).await.unwrap();
        }
        // custom_epg_id is operator data, set directly
        sqlx::query("UPDATE channels SET custom_epg_id = ? WHERE channel_id = ?")
            .bind(custom_epg)
            .bind(id)
            .execute(db.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ingest_then_emit_round_trips_programmes() {
        let db = test_database().await;
        let dir = tempfile::tempdir().unwrap();
        let config = test_config("p1", &["00:1A:79:AA"]);

        // Guide source with one channel and one programme in-window
        let now = Utc::now().timestamp();
        let start = now - 600;
        let stop = now + 3000;
        let sample = format!(
            r#"<tv><channel id="X"><display-name>ABC</display-name></channel>
            <programme start="{}" stop="{}" channel="X"><title>Nightly</title><desc>News</desc></programme></tv>"#,
            format_xmltv_time(start),
            format_xmltv_time(stop),
        );
        let parsed = parse_xmltv(&sample, "s1").unwrap();
        db.upsert_epg_source(&EpgSourceRecord {
            source_id: "s1".into(),
            name: "S1".into(),
            url: String::new(),
            source_type: EpgSourceType::Custom,
            enabled: true,
            interval_hours: 24.0,
            last_fetch: None,
            last_refresh: None,
        })
        .await
        .unwrap();
        db.replace_epg_channels("s1", &parsed.channels)
            .await
            .unwrap();
        let store = ProgrammeStore::open(dir.path(), "s1").await.unwrap();
        store.insert_batch(&parsed.programmes).await.unwrap();

        // A channel row with custom_epg_id="X" binds to the source
        seed_channel(&db, "p1", "42", "ABC Feed HD", "X").await;

        let doc = emit_to_string(db, config, dir.path().to_path_buf())
            .await
            .unwrap();
        assert!(doc.contains(r#"<channel id="X">"#));
        assert!(doc.contains(r#"channel="X""#));
        assert!(doc.contains("<title>Nightly</title>"));
        assert!(doc.contains("<desc>News</desc>"));
        assert!(doc.contains(&format!(r#"start="{}""#, format_xmltv_time(start))));
    }

    #[tokio::test]
    async fn epg_offset_shifts_programme_times() {
        let db = test_database().await;
        let dir = tempfile::tempdir().unwrap();
        let config = test_config("p1", &["00:1A:79:AA"]);
        config
            .update(|file| {
                file.portals.get_mut("p1").unwrap().epg_offset = 60;
            })
            .unwrap();

        let now = Utc::now().timestamp();
        let start = now + 60;
        let stop = now + 3660;
        db.upsert_epg_source(&EpgSourceRecord {
            source_id: "s1".into(),
            name: "S1".into(),
            url: String::new(),
            source_type: EpgSourceType::Custom,
            enabled: true,
            interval_hours: 24.0,
            last_fetch: None,
            last_refresh: None,
        })
        .await
        .unwrap();
        db.replace_epg_channels(
            "s1",
            &[crate::models::EpgChannelRecord {
                source_id: "s1".into(),
                channel_id: "X".into(),
                display_name: "ABC".into(),
                ..Default::default()
            }],
        )
        .await
        .unwrap();
        let store = ProgrammeStore::open(dir.path(), "s1").await.unwrap();
        store
            .insert_batch(&[ProgrammeRow {
                channel_id: "X".into(),
                start_ts: start,
                stop_ts: stop,
                title: "Shifted".into(),
                ..Default::default()
            }])
            .await
            .unwrap();

        seed_channel(&db, "p1", "42", "ABC", "X").await;

        let doc = emit_to_string(db, config, dir.path().to_path_buf())
            .await
            .unwrap();
        // 60-minute portal offset applied at emission
        assert!(doc.contains(&format!(r#"start="{}""#, format_xmltv_time(start + 3600))));
    }

    #[tokio::test]
    async fn duplicate_epg_ids_emit_once() {
        let db = test_database().await;
        let dir = tempfile::tempdir().unwrap();
        let config = test_config("p1", &["00:1A:79:AA"]);

        seed_channel(&db, "p1", "1", "Same Name", "").await;
        seed_channel(&db, "p1", "2", "Same Name", "").await;

        let doc = emit_to_string(db, config, dir.path().to_path_buf())
            .await
            .unwrap();
        let occurrences = doc.matches(r#"<channel id="Same Name">"#).count();
        assert_eq!(occurrences, 1);
    }
}
