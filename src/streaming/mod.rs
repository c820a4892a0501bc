//! Stream dispatch
//!
//! Per-request state machine: reserve a slot against the chosen MAC,
//! obtain a token and stream URL, spawn FFmpeg and pipe its stdout to the
//! client. A failed MAC fails over to the scheduler's next candidate; MAC
//! exhaustion surfaces as a 502 upstream. The in-memory session table is
//! the single authority on per-MAC concurrency.

use bytes::Bytes;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigStore, PortalConfig};
use crate::database::Database;
use crate::errors::{PortalError, StreamError};
use crate::models::{ChannelRecord, MacCandidate, SessionInfo};
use crate::portal::PortalConnector;
use crate::scheduler::{effective_cap, select_macs, ScoreWeights};

/// FFmpeg must produce bytes within this window or the MAC fails over
pub const STARTUP_GRACE: Duration = Duration::from_secs(3);
/// SIGTERM → SIGKILL window on teardown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 64 * 1024;
const STDERR_TAIL: usize = 8;

/// Process-wide live session accounting: `MAC → session set`, one mutex,
/// all reservations and releases go through it.
#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<TableInner>,
}

#[derive(Default)]
struct TableInner {
    sessions: HashMap<Uuid, SessionEntry>,
    by_mac: HashMap<(String, String), HashSet<Uuid>>,
}

struct SessionEntry {
    info: SessionInfo,
    bytes: Arc<AtomicU64>,
}

impl SessionTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Compare-and-set slot reservation: fails when the MAC already
    /// carries `cap` sessions. The returned guard releases on drop.
    pub fn reserve(self: &Arc<Self>, info: SessionInfo, cap: u32) -> Option<SessionGuard> {
        let mut inner = self.inner.lock().expect("session table poisoned");
        let key = (info.portal_id.clone(), info.mac.clone());
        let existing = inner.by_mac.get(&key).map(HashSet::len).unwrap_or(0);
        if existing as u32 >= cap {
            return None;
        }

        let id = Uuid::new_v4();
        let bytes = Arc::new(AtomicU64::new(0));
        inner.by_mac.entry(key).or_default().insert(id);
        inner.sessions.insert(
            id,
            SessionEntry {
                info,
                bytes: bytes.clone(),
            },
        );
        Some(SessionGuard {
            table: self.clone(),
            id,
            bytes,
        })
    }

    fn release(&self, id: Uuid) {
        let mut inner = self.inner.lock().expect("session table poisoned");
        if let Some(entry) = inner.sessions.remove(&id) {
            let key = (entry.info.portal_id.clone(), entry.info.mac.clone());
            if let Some(set) = inner.by_mac.get_mut(&key) {
                set.remove(&id);
                if set.is_empty() {
                    inner.by_mac.remove(&key);
                }
            }
        }
    }

    /// Active session count per MAC for one portal (scheduler input).
    pub fn active_counts(&self, portal_id: &str) -> HashMap<String, usize> {
        let inner = self.inner.lock().expect("session table poisoned");
        inner
            .by_mac
            .iter()
            .filter(|((portal, _), _)| portal == portal_id)
            .map(|((_, mac), set)| (mac.clone(), set.len()))
            .collect()
    }

    /// `/streaming` payload: sessions grouped by portal id.
    pub fn snapshot(&self) -> HashMap<String, Vec<SessionInfo>> {
        let inner = self.inner.lock().expect("session table poisoned");
        let mut out: HashMap<String, Vec<SessionInfo>> = HashMap::new();
        for entry in inner.sessions.values() {
            out.entry(entry.info.portal_id.clone())
                .or_default()
                .push(entry.info.clone());
        }
        for sessions in out.values_mut() {
            sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        }
        out
    }

    pub fn live_count(&self) -> usize {
        self.inner
            .lock()
            .expect("session table poisoned")
            .sessions
            .len()
    }

    /// Invariant check: per-MAC sets and the session map agree.
    pub fn accounted_count(&self) -> usize {
        self.inner
            .lock()
            .expect("session table poisoned")
            .by_mac
            .values()
            .map(HashSet::len)
            .sum()
    }
}

/// RAII slot reservation; dropping it frees the MAC slot.
pub struct SessionGuard {
    table: Arc<SessionTable>,
    id: Uuid,
    bytes: Arc<AtomicU64>,
}

impl SessionGuard {
    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.table.release(self.id);
    }
}

/// A stream ready to hand to the HTTP layer
pub struct ActiveStream {
    pub content_type: &'static str,
    pub receiver: mpsc::Receiver<Result<Bytes, std::io::Error>>,
}

enum TryError {
    /// This MAC is out; ask the scheduler for the next one
    RetryWithNext(String),
}

pub struct StreamDispatcher {
    config: ConfigStore,
    database: Database,
    connector: Arc<dyn PortalConnector>,
    sessions: Arc<SessionTable>,
    ffmpeg_path: String,
}

impl StreamDispatcher {
    pub fn new(
        config: ConfigStore,
        database: Database,
        connector: Arc<dyn PortalConnector>,
        sessions: Arc<SessionTable>,
        ffmpeg_path: String,
    ) -> Self {
        Self {
            config,
            database,
            connector,
            sessions,
            ffmpeg_path,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Serve a play request: walk the scheduler's MAC order until one MAC
    /// yields media bytes, or every candidate is exhausted.
    pub async fn dispatch(
        &self,
        portal_id: &str,
        channel_id: &str,
        client_ip: &str,
    ) -> Result<ActiveStream, StreamError> {
        let portal = self
            .config
            .portal(portal_id)
            .ok_or_else(|| StreamError::UnknownChannel {
                portal_id: portal_id.to_string(),
                channel_id: channel_id.to_string(),
            })?;
        let channel = self
            .database
            .get_channel(portal_id, channel_id)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| StreamError::UnknownChannel {
                portal_id: portal_id.to_string(),
                channel_id: channel_id.to_string(),
            })?;

        info!("IP({client_ip}) requested Portal({portal_id}):Channel({channel_id})");

        let macs = self.candidate_macs(&portal, &channel);
        if macs.is_empty() {
            return Err(StreamError::NoFreeMac {
                portal_id: portal_id.to_string(),
                channel_id: channel_id.to_string(),
            });
        }

        for mac in &macs {
            match self
                .try_mac(portal_id, &portal, &channel, mac, client_ip)
                .await
            {
                Ok(stream) => return Ok(stream),
                Err(TryError::RetryWithNext(reason)) => {
                    info!(
                        "MAC {mac} failed for Portal({portal_id}):Channel({channel_id}): {reason}; trying next"
                    );
                }
            }
        }

        Err(StreamError::Exhausted {
            portal_id: portal_id.to_string(),
            channel_id: channel_id.to_string(),
        })
    }

    /// Scheduler-ordered candidates: the channel's available MACs first;
    /// when availability is unknown the whole portal MAC set competes.
    fn candidate_macs(&self, portal: &PortalConfig, channel: &ChannelRecord) -> Vec<String> {
        let available: HashSet<&String> = channel.available_macs.iter().collect();
        let candidates: Vec<MacCandidate> = portal
            .macs
            .iter()
            .filter(|(mac, _)| available.is_empty() || available.contains(mac))
            .map(|(mac, account)| MacCandidate {
                mac: mac.clone(),
                watchdog_timeout: account.watchdog_timeout,
                playback_limit: account.playback_limit,
                expiry: account.expiry_date(),
            })
            .collect();

        select_macs(
            &candidates,
            &self.sessions.active_counts(&channel.portal_id),
            portal.streams_per_mac,
            ScoreWeights::default(),
            Utc::now().date_naive(),
        )
    }

    async fn try_mac(
        &self,
        portal_id: &str,
        portal: &PortalConfig,
        channel: &ChannelRecord,
        mac: &str,
        client_ip: &str,
    ) -> Result<ActiveStream, TryError> {
        // ACCEPTED: reserve the slot before any portal traffic
        let cap = portal
            .macs
            .get(mac)
            .map(|account| effective_cap(portal.streams_per_mac, account.playback_limit))
            .unwrap_or(1);
        let info = SessionInfo {
            portal_id: portal_id.to_string(),
            portal_name: portal.name.clone(),
            channel_id: channel.channel_id.clone(),
            channel_name: channel.effective_display_name().to_string(),
            mac: mac.to_string(),
            client: client_ip.to_string(),
            start_time: Utc::now(),
        };
        let guard = self
            .sessions
            .reserve(info, cap)
            .ok_or_else(|| TryError::RetryWithNext("MAC at playback limit".into()))?;

        let (guard, link) = self
            .acquire_link(portal_id, portal, channel, mac, guard)
            .await?;

        // PIPING: spawn FFmpeg and demand bytes within the startup grace
        let settings = self.config.settings();
        let proxy = portal.proxy.as_str();
        let args = build_ffmpeg_args(
            &settings.ffmpeg_command,
            &link,
            proxy,
            u64::from(settings.ffmpeg_timeout) * 1_000_000,
        );
        debug!("Spawning {} {}", self.ffmpeg_path, args.join(" "));

        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TryError::RetryWithNext(format!("ffmpeg spawn failed: {e}")))?;

        let stderr_tail = spawn_stderr_drain(&mut child);
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| TryError::RetryWithNext("ffmpeg stdout unavailable".into()))?;

        let mut first = vec![0u8; READ_CHUNK];
        let first_len = match tokio::time::timeout(STARTUP_GRACE, stdout.read(&mut first)).await {
            Ok(Ok(n)) if n > 0 => n,
            Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
                terminate_child(child, Duration::from_millis(100)).await;
                return Err(TryError::RetryWithNext(
                    StreamError::StartTimeout(STARTUP_GRACE).to_string(),
                ));
            }
        };
        first.truncate(first_len);
        guard.add_bytes(first_len as u64);

        info!(
            "Streaming Portal({portal_id}):Channel({}) via MAC({mac}) to {client_ip}",
            channel.channel_id
        );

        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);
        tokio::spawn(pump_stream(
            child,
            stdout,
            Bytes::from(first),
            guard,
            tx,
            stderr_tail,
        ));

        let content_type = if settings.output_format == "mpegts" {
            "video/mp2t"
        } else {
            "application/vnd.apple.mpegurl"
        };
        Ok(ActiveStream {
            content_type,
            receiver: rx,
        })
    }

    /// Token + profile + stream URL for one MAC. Profile results update
    /// the MAC record best-effort.
    async fn acquire_link(
        &self,
        portal_id: &str,
        portal: &PortalConfig,
        channel: &ChannelRecord,
        mac: &str,
        guard: SessionGuard,
    ) -> Result<(SessionGuard, String), TryError> {
        let session = self
            .connector
            .connect(portal, mac)
            .await
            .map_err(|e| TryError::RetryWithNext(format!("connect: {e}")))?;

        if let Ok(profile) = session.get_profile().await {
            let now = Utc::now().timestamp();
            self.config.update_mac(portal_id, mac, |account| {
                let watchdog = profile.watchdog_timeout_seconds();
                if watchdog > 0 {
                    account.watchdog_timeout = watchdog;
                }
                let limit = profile.playback_limit_value();
                if limit > 0 {
                    account.playback_limit = limit;
                }
                account.last_profile_fetch = Some(now);
            });
        }

        let cmd = if channel.cmd.is_empty() {
            self.find_cmd_live(session.as_ref(), channel).await
        } else {
            Some(channel.cmd.clone())
        };
        let Some(cmd) = cmd else {
            return Err(TryError::RetryWithNext("no stream command".into()));
        };

        match session.get_link(&cmd).await {
            Ok(link) => Ok((guard, link)),
            Err(PortalError::NoLink) => {
                Err(TryError::RetryWithNext("portal returned no link".into()))
            }
            Err(err) => Err(TryError::RetryWithNext(format!("link: {err}"))),
        }
    }

    /// Fallback when the catalog has no cached cmd: search the live
    /// listing, honouring merged alternate ids.
    async fn find_cmd_live(
        &self,
        session: &dyn crate::portal::PortalSession,
        channel: &ChannelRecord,
    ) -> Option<String> {
        let listing = session.get_all_channels().await.ok()?;
        let mut ids = vec![channel.channel_id.clone()];
        ids.extend(channel.alternate_ids.iter().cloned());
        for id in ids {
            if let Some(found) = listing.iter().find(|c| c.id == id) {
                if let Some(cmd) = &found.cmd {
                    if !cmd.trim().is_empty() {
                        if id != channel.channel_id {
                            info!(
                                "Using alternate channel id {id} instead of {}",
                                channel.channel_id
                            );
                        }
                        return Some(cmd.clone());
                    }
                }
            }
        }
        None
    }
}

/// Pipe FFmpeg stdout into the response channel until the client leaves
/// or FFmpeg exits; either way the session guard drops here.
async fn pump_stream(
    child: Child,
    mut stdout: tokio::process::ChildStdout,
    first: Bytes,
    guard: SessionGuard,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    stderr_tail: Arc<Mutex<Vec<String>>>,
) {
    if tx.send(Ok(first)).await.is_err() {
        terminate_child(child, SHUTDOWN_GRACE).await;
        return;
    }

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => {
                // FFmpeg exited; a non-zero status gets its stderr tail
                let mut child = child;
                if let Ok(Some(status)) = child.try_wait() {
                    if !status.success() {
                        let tail = stderr_tail.lock().expect("stderr tail poisoned");
                        warn!(
                            "FFmpeg closed with {status}; stderr tail: {}",
                            tail.join(" | ")
                        );
                    }
                }
                break;
            }
            Ok(n) => {
                guard.add_bytes(n as u64);
                if tx
                    .send(Ok(Bytes::copy_from_slice(&buf[..n])))
                    .await
                    .is_err()
                {
                    // ClientDisconnected: clean teardown, not an error
                    debug!("Client disconnected, terminating FFmpeg");
                    terminate_child(child, SHUTDOWN_GRACE).await;
                    return;
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                terminate_child(child, SHUTDOWN_GRACE).await;
                return;
            }
        }
    }
    drop(guard);
}

/// Bounded stderr tail for post-mortem logs.
fn spawn_stderr_drain(child: &mut Child) -> Arc<Mutex<Vec<String>>> {
    let tail: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    if let Some(stderr) = child.stderr.take() {
        let tail = tail.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }
                debug!("ffmpeg: {line}");
                let mut tail = tail.lock().expect("stderr tail poisoned");
                if tail.len() >= STDERR_TAIL {
                    tail.remove(0);
                }
                tail.push(line);
            }
        });
    }
    tail
}

/// SIGTERM, wait out the grace period, SIGKILL.
pub async fn terminate_child(mut child: Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Expand the operator's FFmpeg command template. `<proxy>` disappears
/// with its flag when the portal has none.
pub fn build_ffmpeg_args(template: &str, url: &str, proxy: &str, timeout_us: u64) -> Vec<String> {
    let mut command = template.to_string();
    command = command.replace("<url>", url);
    command = command.replace("<timeout>", &timeout_us.to_string());
    if proxy.is_empty() {
        command = command.replace("-http_proxy <proxy>", "");
    } else {
        command = command.replace("<proxy>", proxy);
    }
    command.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::{raw_channel, test_config, StubConnector, StubPortal};
    use crate::database::channels::upsert_channel;
    use crate::database::test_database;

    fn info(portal: &str, mac: &str) -> SessionInfo {
        SessionInfo {
            portal_id: portal.into(),
            portal_name: "Portal".into(),
            channel_id: "1".into(),
            channel_name: "One".into(),
            mac: mac.into(),
            client: "10.0.0.1".into(),
            start_time: Utc::now(),
        }
    }

    #[test]
    fn reserve_rejects_at_cap() {
        let table = SessionTable::new();
        let a = table.reserve(info("p1", "AA"), 2);
        let b = table.reserve(info("p1", "AA"), 2);
        assert!(a.is_some() && b.is_some());
        assert!(table.reserve(info("p1", "AA"), 2).is_none());

        drop(b);
        assert!(table.reserve(info("p1", "AA"), 2).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_exceed_cap() {
        let table = SessionTable::new();
        let cap = 3u32;
        let mut handles = Vec::new();
        for _ in 0..64 {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                let guard = table.reserve(info("p1", "AA"), cap);
                if guard.is_some() {
                    // Hold briefly so reservations overlap
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    assert!(table.live_count() <= cap as usize);
                }
                guard.is_some()
            }));
        }
        let granted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert!(granted >= cap as usize);
        assert_eq!(table.live_count(), 0, "all guards released");
        assert_eq!(table.accounted_count(), 0);
    }

    #[test]
    fn session_accounting_stays_consistent() {
        let table = SessionTable::new();
        let mut guards = Vec::new();
        for i in 0..10 {
            let mac = if i % 2 == 0 { "AA" } else { "BB" };
            if let Some(guard) = table.reserve(info("p1", mac), 8) {
                guards.push(guard);
            }
        }
        assert_eq!(table.live_count(), guards.len());
        assert_eq!(table.accounted_count(), guards.len());

        guards.truncate(3);
        assert_eq!(table.live_count(), 3);
        assert_eq!(table.accounted_count(), 3);

        guards.clear();
        assert_eq!(table.live_count(), 0);
        assert_eq!(table.accounted_count(), 0);
    }

    #[test]
    fn snapshot_groups_by_portal() {
        let table = SessionTable::new();
        let _a = table.reserve(info("p1", "AA"), 4).unwrap();
        let _b = table.reserve(info("p1", "BB"), 4).unwrap();
        let _c = table.reserve(info("p2", "CC"), 4).unwrap();
        let snapshot = table.snapshot();
        assert_eq!(snapshot.get("p1").map(Vec::len), Some(2));
        assert_eq!(snapshot.get("p2").map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn terminate_child_honours_grace_window() {
        let child = Command::new("sleep").arg("30").stdin(Stdio::null()).spawn();
        let Ok(child) = child else {
            return; // environment without coreutils
        };
        let started = std::time::Instant::now();
        terminate_child(child, SHUTDOWN_GRACE).await;
        // sleep dies on SIGTERM, so teardown finishes well inside
        // grace + 100ms
        assert!(started.elapsed() < SHUTDOWN_GRACE + Duration::from_millis(100));
    }

    #[test]
    fn ffmpeg_template_expansion() {
        let args = build_ffmpeg_args(
            "-re -http_proxy <proxy> -timeout <timeout> -i <url> -codec copy -f mpegts pipe:",
            "http://origin/live.m3u8",
            "",
            5_000_000,
        );
        assert!(!args.contains(&"-http_proxy".to_string()));
        assert!(args.contains(&"http://origin/live.m3u8".to_string()));
        assert!(args.contains(&"5000000".to_string()));

        let with_proxy = build_ffmpeg_args(
            "-http_proxy <proxy> -i <url> pipe:",
            "http://origin/x",
            "http://proxy:3128",
            1,
        );
        assert!(with_proxy.contains(&"http://proxy:3128".to_string()));
    }

    async fn seeded_dispatcher(portal: Arc<StubPortal>, cmd: &str) -> (StreamDispatcher, Database) {
        let database = test_database().await;
        {
            let mut conn = database.pool().acquire().await.unwrap();
            let rec = ChannelRecord {
                portal_id: "p1".into(),
                channel_id: "1".into(),
                name: "BBC One".into(),
                cmd: cmd.into(),
                enabled: true,
                available_macs: vec!["00:1A:79:AA".into(), "00:1A:79:BB".into()],
                channel_hash: "h".into(),
                ..Default::default()
            };
            upsert_channel(&mut conn, &rec).await.unwrap();
        }
        let config = test_config("p1", &["00:1A:79:AA", "00:1A:79:BB"]);
        let dispatcher = StreamDispatcher::new(
            config,
            database.clone(),
            Arc::new(StubConnector(portal)),
            SessionTable::new(),
            "ffmpeg".into(),
        );
        (dispatcher, database)
    }

    #[tokio::test]
    async fn link_failover_walks_mac_order() {
        // First MAC answers with the no-link sentinel, second yields a
        // URL; acquire_link must fail over and succeed on the second.
        let stub = Arc::new(StubPortal::default());
        let cmd = "ffmpeg http://localhost/ch/1";
        stub.set_link("00:1A:79:BB", cmd, "http://origin/live/1.m3u8");
        let (dispatcher, _db) = seeded_dispatcher(stub.clone(), cmd).await;

        let portal = dispatcher.config.portal("p1").unwrap();
        let channel = dispatcher
            .database
            .get_channel("p1", "1")
            .await
            .unwrap()
            .unwrap();

        // First MAC: sentinel → RetryWithNext
        let guard = dispatcher
            .sessions
            .reserve(info("p1", "00:1A:79:AA"), 1)
            .unwrap();
        let first = dispatcher
            .acquire_link("p1", &portal, &channel, "00:1A:79:AA", guard)
            .await;
        assert!(first.is_err());
        assert_eq!(
            dispatcher.sessions.live_count(),
            0,
            "slot released on failure"
        );

        // Second MAC: valid URL
        let guard = dispatcher
            .sessions
            .reserve(info("p1", "00:1A:79:BB"), 1)
            .unwrap();
        let (_guard, link) = dispatcher
            .acquire_link("p1", &portal, &channel, "00:1A:79:BB", guard)
            .await
            .map_err(|TryError::RetryWithNext(r)| r)
            .unwrap();
        assert_eq!(link, "http://origin/live/1.m3u8");
    }

    #[tokio::test]
    async fn cached_cmd_skips_live_listing() {
        let stub = Arc::new(StubPortal::default());
        let cmd = "ffmpeg http://localhost/ch/1";
        stub.set_link("00:1A:79:AA", cmd, "http://origin/1");
        let (dispatcher, _db) = seeded_dispatcher(stub.clone(), cmd).await;

        let portal = dispatcher.config.portal("p1").unwrap();
        let channel = dispatcher
            .database
            .get_channel("p1", "1")
            .await
            .unwrap()
            .unwrap();
        let guard = dispatcher
            .sessions
            .reserve(info("p1", "00:1A:79:AA"), 1)
            .unwrap();
        dispatcher
            .acquire_link("p1", &portal, &channel, "00:1A:79:AA", guard)
            .await
            .map_err(|TryError::RetryWithNext(r)| r)
            .unwrap();
        assert_eq!(
            stub.listing_calls(),
            0,
            "cached cmd avoids get_all_channels"
        );
        assert_eq!(stub.link_calls(), 1);
    }

    #[tokio::test]
    async fn alternate_id_used_when_primary_missing() {
        let stub = Arc::new(StubPortal::default());
        stub.set_channels(
            "00:1A:79:AA",
            vec![raw_channel("9", "BBC One", "ffmpeg http://localhost/ch/9")],
        );
        stub.set_link(
            "00:1A:79:AA",
            "ffmpeg http://localhost/ch/9",
            "http://origin/9",
        );
        let (dispatcher, database) = seeded_dispatcher(stub.clone(), "").await;
        sqlx::query("UPDATE channels SET alternate_ids = '9' WHERE channel_id = '1'")
            .execute(database.pool())
            .await
            .unwrap();

        let portal = dispatcher.config.portal("p1").unwrap();
        let channel = dispatcher
            .database
            .get_channel("p1", "1")
            .await
            .unwrap()
            .unwrap();
        let guard = dispatcher
            .sessions
            .reserve(info("p1", "00:1A:79:AA"), 1)
            .unwrap();
        let (_guard, link) = dispatcher
            .acquire_link("p1", &portal, &channel, "00:1A:79:AA", guard)
            .await
            .map_err(|TryError::RetryWithNext(r)| r)
            .unwrap();
        assert_eq!(link, "http://origin/9");
    }
}
