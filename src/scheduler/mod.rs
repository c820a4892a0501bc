//! MAC scheduler
//!
//! Scores the MACs of a portal for a playback request and returns an
//! ordered candidate list. Pure over its inputs: the session table passes
//! in active counts, config passes in the per-portal cap, and `today`
//! makes expiry filtering deterministic under test.

use chrono::NaiveDate;
use std::collections::HashMap;

use crate::models::MacCandidate;

/// Scoring weights; the defaults match the tuned production values.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub idle: f64,
    pub slots: f64,
    pub expiry: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            idle: 1.0,
            slots: 0.6,
            expiry: 0.4,
        }
    }
}

/// Days-to-expiry window that starts costing score
const EXPIRY_HORIZON_DAYS: i64 = 30;

/// Effective concurrent-stream cap for one MAC: the lesser of the portal
/// configuration and the portal-reported limit, unknown values excluded;
/// fully unknown means one stream.
pub fn effective_cap(streams_per_mac: u32, playback_limit: u32) -> u32 {
    match (streams_per_mac, playback_limit) {
        (0, 0) => 1,
        (cap, 0) | (0, cap) => cap,
        (a, b) => a.min(b),
    }
}

/// Idle preference: long-idle MACs (high watchdog timeout) are the least
/// likely to trip a portal-side concurrency check.
fn f_idle(watchdog_timeout: u32) -> f64 {
    match watchdog_timeout {
        0..=59 => 0.0,
        60..=299 => 0.3,
        300..=1799 => 0.7,
        _ => 1.0,
    }
}

/// 0.0 far from expiry → 1.0 at expiry; unknown expiry costs nothing.
fn closeness_to_expiry(expiry: Option<NaiveDate>, today: NaiveDate) -> f64 {
    match expiry {
        Some(date) => {
            let days = (date - today).num_days();
            if days <= 0 {
                1.0
            } else if days >= EXPIRY_HORIZON_DAYS {
                0.0
            } else {
                (EXPIRY_HORIZON_DAYS - days) as f64 / EXPIRY_HORIZON_DAYS as f64
            }
        }
        None => 0.0,
    }
}

/// Produce the ordered MAC list for `(portal, channel)`.
///
/// The domain is the caller-supplied candidate set (already intersected
/// with the channel's `available_macs`), filtered for expiry and
/// busy-ness. The result is a slice to try in order, not a single pick.
pub fn select_macs(
    candidates: &[MacCandidate],
    active_counts: &HashMap<String, usize>,
    streams_per_mac: u32,
    weights: ScoreWeights,
    today: NaiveDate,
) -> Vec<String> {
    let mut scored: Vec<(f64, u32, Option<NaiveDate>, &str)> = Vec::new();

    for candidate in candidates {
        if let Some(expiry) = candidate.expiry {
            if expiry < today {
                continue;
            }
        }

        let cap = effective_cap(streams_per_mac, candidate.playback_limit);
        let active = *active_counts.get(&candidate.mac).unwrap_or(&0) as u32;
        if active >= cap {
            continue;
        }
        let free_slots = cap - active;

        let score = weights.idle * f_idle(candidate.watchdog_timeout)
            + weights.slots * f64::from(free_slots) / f64::from(cap.max(1))
            - weights.expiry * closeness_to_expiry(candidate.expiry, today);

        scored.push((score, free_slots, candidate.expiry, candidate.mac.as_str()));
    }

    // Ties: more free slots, later expiry (unknown sorts as latest),
    // lexicographic MAC.
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.cmp(&a.1))
            .then_with(|| match (a.2, b.2) {
                (None, None) => std::cmp::Ordering::Equal,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(x), Some(y)) => y.cmp(&x),
            })
            .then_with(|| a.3.cmp(b.3))
    });

    scored
        .into_iter()
        .map(|(_, _, _, mac)| mac.to_string())
        .collect()
}
