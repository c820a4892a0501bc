//! M3U playlist emission
//!
//! Enabled channels in effective-display-name order (stable tie-break on
//! portal and channel id, inherited from the catalog query), each entry
//! pointing back at this proxy's `/play/` route. Two emissions over the
//! same catalog snapshot are byte-identical.

use anyhow::Result;

use crate::database::Database;
use crate::models::ChannelRecord;

/// Render the playlist for the given public host (scheme-less host[:port],
/// from configuration or the request's Host header).
pub async fn generate_playlist(database: &Database, public_host: &str) -> Result<String> {
    let channels = database.list_enabled_channels().await?;
    Ok(render(&channels, public_host))
}

fn render(channels: &[ChannelRecord], public_host: &str) -> String {
    let mut out = String::with_capacity(channels.len() * 160 + 16);
    out.push_str("#EXTM3U\n");

    for channel in channels {
        let name = channel.effective_display_name();
        let number = channel.effective_number();
        let group = channel.effective_genre();
        let epg_id = channel.effective_epg_id();

        out.push_str("#EXTINF:-1");
        push_attr(&mut out, "tvg-id", epg_id);
        push_attr(&mut out, "tvg-name", name);
        if !channel.logo.is_empty() {
            push_attr(&mut out, "tvg-logo", &channel.logo);
        }
        if !number.is_empty() {
            push_attr(&mut out, "tvg-chno", number);
        }
        if !group.is_empty() {
            push_attr(&mut out, "group-title", group);
        }
        out.push(',');
        out.push_str(name);
        out.push('\n');
        out.push_str(&format!(
            "http://{}/play/{}/{}\n",
            public_host, channel.portal_id, channel.channel_id
        ));
    }

    out
}

fn push_attr(out: &mut String, key: &str, value: &str) {
    out.push(' ');
    out.push_str(key);
    out.push_str("=\"");
    // Double quotes would break attribute parsing in downstream players
    out.push_str(&value.replace('"', "'"));
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: &str, name: &str) -> ChannelRecord {
        ChannelRecord {
            portal_id: "p1".into(),
            channel_id: id.into(),
            name: name.into(),
            number: id.into(),
            genre: "News".into(),
            logo: format!("http://logos/{id}.png"),
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn entries_carry_standard_attributes() {
        let out = render(&[channel("1", "BBC One")], "proxy.local:8001");
        assert!(out.starts_with("#EXTM3U\n"));
        assert!(out.contains(r#"tvg-id="BBC One""#));
        assert!(out.contains(r#"tvg-name="BBC One""#));
        assert!(out.contains(r#"tvg-logo="http://logos/1.png""#));
        assert!(out.contains(r#"tvg-chno="1""#));
        assert!(out.contains(r#"group-title="News""#));
        assert!(out.contains(",BBC One\nhttp://proxy.local:8001/play/p1/1\n"));
    }

    #[test]
    fn custom_overrides_take_precedence() {
        let mut ch = channel("1", "BBC One FHD");
        ch.custom_name = "BBC 1".into();
        ch.custom_number = "101".into();
        ch.custom_genre = "UK".into();
        ch.custom_epg_id = "bbc1.uk".into();
        let out = render(&[ch], "host");
        assert!(out.contains(r#"tvg-id="bbc1.uk""#));
        assert!(out.contains(r#"tvg-name="BBC 1""#));
        assert!(out.contains(r#"tvg-chno="101""#));
        assert!(out.contains(r#"group-title="UK""#));
    }

    #[test]
    fn emission_is_byte_stable() {
        let channels = vec![channel("1", "A"), channel("2", "B")];
        let a = render(&channels, "host");
        let b = render(&channels, "host");
        assert_eq!(a, b);
    }

    #[test]
    fn quotes_in_names_are_sanitized() {
        let out = render(&[channel("1", r#"The "Best" Channel"#)], "host");
        assert!(out.contains(r#"tvg-name="The 'Best' Channel""#));
    }
}
