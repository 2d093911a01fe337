//! Background refresh of the rule list.
//!
//! Each cycle walks `Idle -> Checking -> Downloading -> Parsing -> Publishing`
//! and falls back to `Idle` on any error. A failed cycle never touches the
//! published list, so clients keep the last good PAC until the next tick.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::Utc;
use hyper::header::{HeaderMap, HeaderValue, LAST_MODIFIED};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::PacCache;
use crate::config::{Encoding, ListSource};
use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::filter::{Blocklist, parse_rules};
use crate::stats::Stats;
use crate::store::{Store, format_date, last_modified};

/// Downloads the raw list body.
#[async_trait]
pub trait Download: Send + Sync {
    async fn download(&self, url: &Url) -> Result<Bytes>;
}

#[async_trait]
impl Download for Fetcher {
    async fn download(&self, url: &Url) -> Result<Bytes> {
        self.get(url).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpdateState {
    Idle = 0,
    Checking = 1,
    Downloading = 2,
    Parsing = 3,
    Publishing = 4,
}

impl UpdateState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Checking,
            2 => Self::Downloading,
            3 => Self::Parsing,
            4 => Self::Publishing,
            _ => Self::Idle,
        }
    }
}

/// Why a cycle stopped at `Checking`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The local copy is younger than the staleness threshold.
    Fresh,
    MissingLastModified,
    InvalidLastModified,
    HeadFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    Updated { domains: usize },
}

pub struct ListUpdater {
    url: Url,
    filename: String,
    encoding: Encoding,
    expiry: Duration,
    fetch_timeout: Duration,
    downloader: Arc<dyn Download>,
    store: Arc<dyn Store>,
    blocklist: Arc<Blocklist>,
    cache: Arc<PacCache>,
    stats: Arc<Stats>,
    state: AtomicU8,
    cancel: CancellationToken,
}

impl ListUpdater {
    pub fn new(
        source: &ListSource,
        downloader: Arc<dyn Download>,
        store: Arc<dyn Store>,
        blocklist: Arc<Blocklist>,
        cache: Arc<PacCache>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            url: source.url.clone(),
            filename: source.filename.clone(),
            encoding: source.encoding,
            expiry: source.expiry,
            fetch_timeout: source.fetch_timeout,
            downloader,
            store,
            blocklist,
            cache,
            stats,
            state: AtomicU8::new(UpdateState::Idle as u8),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> UpdateState {
        UpdateState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: UpdateState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Publish the stored list, downloading it first if there is none.
    ///
    /// Any error here is fatal to startup: without a list there is nothing
    /// to serve.
    pub async fn load_initial(&self) -> Result<usize> {
        match self.store.get(&self.filename).await {
            Ok(object) => {
                let domains = parse_rules(&object.content[..])?;
                if domains.is_empty() {
                    return Err(empty_list());
                }
                let fetched_at = last_modified(&object.headers)
                    .and_then(|r| r.ok())
                    .unwrap_or_else(Utc::now);
                let count = domains.len();
                self.blocklist.update(domains, fetched_at);
                info!(filename = %self.filename, domains = count, "loaded rule list");
                Ok(count)
            }
            Err(e) if e.is_not_found() => {
                info!(filename = %self.filename, url = %self.url, "no local rule list; downloading");
                let result = self.refresh().await;
                self.set_state(UpdateState::Idle);
                result
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run one cycle. `force` skips the staleness check.
    pub async fn run_cycle(&self, force: bool) -> Result<CycleOutcome> {
        let result = self.cycle(force).await;
        self.set_state(UpdateState::Idle);
        result
    }

    async fn cycle(&self, force: bool) -> Result<CycleOutcome> {
        if !force {
            self.set_state(UpdateState::Checking);
            if let Some(reason) = self.check().await {
                return Ok(CycleOutcome::Skipped(reason));
            }
        }
        let domains = self.refresh().await?;
        Ok(CycleOutcome::Updated { domains })
    }

    async fn check(&self) -> Option<SkipReason> {
        let headers = match self.store.head(&self.filename).await {
            Ok(headers) => headers,
            Err(e) if e.is_not_found() => return None,
            Err(e) => {
                warn!(filename = %self.filename, error = %e, "stat of local rule list failed");
                return Some(SkipReason::HeadFailed);
            }
        };

        let modified = match last_modified(&headers) {
            Some(Ok(at)) => at,
            Some(Err(e)) => {
                warn!(filename = %self.filename, error = %e, "unparsable Last-Modified");
                return Some(SkipReason::InvalidLastModified);
            }
            None => {
                warn!(filename = %self.filename, "local rule list has no Last-Modified");
                return Some(SkipReason::MissingLastModified);
            }
        };

        let age = (Utc::now() - modified).to_std().unwrap_or(Duration::ZERO);
        if age < self.expiry {
            debug!(?age, expiry = ?self.expiry, "rule list is fresh");
            return Some(SkipReason::Fresh);
        }
        None
    }

    /// Download, parse and publish. The published list is only replaced once
    /// the new one has parsed and been persisted.
    async fn refresh(&self) -> Result<usize> {
        self.set_state(UpdateState::Downloading);
        info!(url = %self.url, "downloading rule list");
        let raw = self.download().await?;

        self.set_state(UpdateState::Parsing);
        let content = decode(self.encoding, raw)?;
        let domains = parse_rules(&content[..])?;
        if domains.is_empty() {
            return Err(empty_list());
        }

        self.set_state(UpdateState::Publishing);
        let now = Utc::now();
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&format_date(now)) {
            headers.insert(LAST_MODIFIED, value);
        }
        self.store.put(&self.filename, headers, content).await?;

        let count = domains.len();
        self.blocklist.update(domains, now);
        self.cache.clear_all();
        self.stats.record_list_update();
        info!(domains = count, "published rule list");
        Ok(count)
    }

    async fn download(&self) -> Result<Bytes> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(self.fetch_timeout, self.downloader.download(&self.url)) => {
                result.map_err(|_| Error::Timeout(self.fetch_timeout))?
            }
        }
    }

    /// Start the refresh loop. The first cycle runs immediately.
    pub fn spawn(self: Arc<Self>, period: Duration) -> UpdaterHandle {
        let trigger = Arc::new(Notify::new());
        let cancel = self.cancel.clone();
        let task = tokio::spawn({
            let trigger = Arc::clone(&trigger);
            async move { self.run(period, trigger).await }
        });
        UpdaterHandle { trigger, cancel, task }
    }

    async fn run(&self, period: Duration, trigger: Arc<Notify>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let force = tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => false,
                _ = trigger.notified() => true,
            };

            match self.run_cycle(force).await {
                Ok(CycleOutcome::Updated { domains }) => debug!(domains, force, "cycle updated list"),
                Ok(CycleOutcome::Skipped(reason)) => debug!(?reason, "cycle skipped"),
                Err(Error::Cancelled) => break,
                Err(e) => {
                    self.stats.record_failed_update();
                    warn!(error = %e, retryable = e.is_retryable(), "rule list update failed; keeping current list");
                }
            }
        }
        debug!("rule list updater stopped");
    }
}

/// Controls a spawned updater loop.
pub struct UpdaterHandle {
    trigger: Arc<Notify>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl UpdaterHandle {
    /// Run a forced cycle as soon as the loop is free.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Cancel any in-progress download and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "rule list updater task failed");
        }
    }
}

fn decode(encoding: Encoding, raw: Bytes) -> Result<Bytes> {
    match encoding {
        Encoding::Identity => Ok(raw),
        Encoding::Base64 => {
            // Published lists wrap lines; the decoder does not accept whitespace.
            let compact: Vec<u8> = raw.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
            Ok(Bytes::from(STANDARD.decode(compact)?))
        }
    }
}

fn empty_list() -> Error {
    Error::Parse(io::Error::new(io::ErrorKind::InvalidData, "rule list contains no domains"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::MemoryStore;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    const RULES: &str = "[AutoProxy 0.2.9]\n! comment\n||example.com\n.blocked.org/path\n@@||allowed.net\n";

    struct FakeDownload {
        body: Mutex<Option<Bytes>>,
        hang: bool,
        calls: AtomicUsize,
    }

    impl FakeDownload {
        fn serving(body: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                body: Mutex::new(Some(Bytes::copy_from_slice(body))),
                hang: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                body: Mutex::new(None),
                hang: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                body: Mutex::new(None),
                hang: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Download for FakeDownload {
        async fn download(&self, url: &Url) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.body
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| Error::fetch(url.as_str(), "connection refused"))
        }
    }

    struct Fixture {
        updater: ListUpdater,
        store: Arc<MemoryStore>,
        blocklist: Arc<Blocklist>,
        cache: Arc<PacCache>,
        stats: Arc<Stats>,
    }

    fn fixture(downloader: Arc<FakeDownload>, encoding: Encoding) -> Fixture {
        let mut source = Config::default().list_source().unwrap();
        source.encoding = encoding;
        source.expiry = Duration::from_secs(3600);
        source.fetch_timeout = Duration::from_secs(5);

        let store = Arc::new(MemoryStore::new());
        let blocklist = Arc::new(Blocklist::from_domains(vec!["old.example".into()]));
        let cache = Arc::new(PacCache::new());
        let stats = Arc::new(Stats::new());
        let updater = ListUpdater::new(
            &source,
            downloader,
            store.clone(),
            blocklist.clone(),
            cache.clone(),
            stats.clone(),
        );
        Fixture {
            updater,
            store,
            blocklist,
            cache,
            stats,
        }
    }

    async fn put_local(store: &MemoryStore, content: &str, last_modified: &str) {
        let mut headers = HeaderMap::new();
        headers.insert(LAST_MODIFIED, HeaderValue::from_str(last_modified).unwrap());
        store
            .put("gfwlist.txt", headers, Bytes::from(content.to_string()))
            .await
            .unwrap();
    }

    fn cached_pac(cache: &PacCache) {
        cache.set("/proxy.pac", Arc::from("stale"), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn fresh_copy_skips_download() {
        let downloader = FakeDownload::serving(RULES.as_bytes());
        let f = fixture(downloader.clone(), Encoding::Identity);
        put_local(&f.store, RULES, &format_date(Utc::now())).await;

        let outcome = f.updater.run_cycle(false).await.unwrap();

        assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::Fresh));
        assert_eq!(downloader.calls(), 0);
        assert_eq!(f.updater.state(), UpdateState::Idle);
    }

    #[tokio::test]
    async fn stale_copy_is_replaced() {
        let encoded = STANDARD.encode(RULES);
        // Wrapped like the published list.
        let wrapped = encoded
            .as_bytes()
            .chunks(16)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        let downloader = FakeDownload::serving(wrapped.as_bytes());
        let f = fixture(downloader.clone(), Encoding::Base64);
        put_local(&f.store, "||old.example\n", &format_date(Utc::now() - chrono::Duration::days(2))).await;
        cached_pac(&f.cache);

        let outcome = f.updater.run_cycle(false).await.unwrap();

        assert_eq!(outcome, CycleOutcome::Updated { domains: 2 });
        assert_eq!(downloader.calls(), 1);
        assert!(f.blocklist.is_blocked("www.example.com"));
        assert!(f.blocklist.is_blocked("blocked.org"));
        assert!(!f.blocklist.is_blocked("old.example"));
        assert!(f.cache.is_empty());
        assert_eq!(f.stats.list_updates.load(Ordering::Relaxed), 1);

        // The decoded text is what gets persisted.
        let stored = f.store.get("gfwlist.txt").await.unwrap();
        assert_eq!(&stored.content[..], RULES.as_bytes());
        assert!(last_modified(&stored.headers).unwrap().is_ok());
    }

    #[tokio::test]
    async fn missing_copy_counts_as_stale() {
        let downloader = FakeDownload::serving(RULES.as_bytes());
        let f = fixture(downloader.clone(), Encoding::Identity);

        let outcome = f.updater.run_cycle(false).await.unwrap();

        assert_eq!(outcome, CycleOutcome::Updated { domains: 2 });
    }

    #[tokio::test]
    async fn unparsable_last_modified_skips() {
        let downloader = FakeDownload::serving(RULES.as_bytes());
        let f = fixture(downloader.clone(), Encoding::Identity);
        put_local(&f.store, RULES, "yesterday-ish").await;

        let outcome = f.updater.run_cycle(false).await.unwrap();

        assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::InvalidLastModified));
        assert_eq!(downloader.calls(), 0);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_current_list() {
        let f = fixture(FakeDownload::failing(), Encoding::Identity);
        cached_pac(&f.cache);

        let err = f.updater.run_cycle(true).await.unwrap_err();

        assert!(matches!(err, Error::Fetch { .. }));
        assert!(err.is_retryable());
        assert!(f.blocklist.is_blocked("old.example"));
        assert_eq!(f.cache.len(), 1);
        assert!(f.store.is_empty());
        assert_eq!(f.updater.state(), UpdateState::Idle);
    }

    #[tokio::test]
    async fn bad_encoding_or_empty_list_keeps_current_list() {
        let f = fixture(FakeDownload::serving(b"!!not base64!!"), Encoding::Base64);
        assert!(matches!(f.updater.run_cycle(true).await, Err(Error::Decode(_))));
        assert!(f.blocklist.is_blocked("old.example"));

        let f = fixture(FakeDownload::serving(b"! only comments\n"), Encoding::Identity);
        assert!(matches!(f.updater.run_cycle(true).await, Err(Error::Parse(_))));
        assert!(f.blocklist.is_blocked("old.example"));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn load_initial_prefers_local_copy() {
        let downloader = FakeDownload::serving(b"||remote.example\n");
        let f = fixture(downloader.clone(), Encoding::Identity);
        let stamped = Utc::now() - chrono::Duration::hours(1);
        put_local(&f.store, RULES, &format_date(stamped)).await;

        assert_eq!(f.updater.load_initial().await.unwrap(), 2);
        assert_eq!(downloader.calls(), 0);
        assert!(f.blocklist.is_blocked("example.com"));
        assert_eq!(f.blocklist.snapshot().fetched_at().timestamp(), stamped.timestamp());
    }

    #[tokio::test]
    async fn load_initial_bootstraps_or_fails() {
        let downloader = FakeDownload::serving(RULES.as_bytes());
        let f = fixture(downloader.clone(), Encoding::Identity);
        assert_eq!(f.updater.load_initial().await.unwrap(), 2);
        assert_eq!(downloader.calls(), 1);
        assert_eq!(f.store.len(), 1);

        let f = fixture(FakeDownload::failing(), Encoding::Identity);
        assert!(f.updater.load_initial().await.is_err());
    }

    #[tokio::test]
    async fn shutdown_cancels_download() {
        let downloader = FakeDownload::hanging();
        let f = fixture(downloader.clone(), Encoding::Identity);
        let updater = Arc::new(f.updater);

        let handle = Arc::clone(&updater).spawn(Duration::from_secs(3600));
        // First tick is immediate; the local copy is missing so it downloads.
        while downloader.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(updater.state(), UpdateState::Downloading);

        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .unwrap();
        assert_eq!(updater.state(), UpdateState::Idle);
        assert_eq!(f.stats.failed_updates.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn trigger_forces_a_cycle() {
        let downloader = FakeDownload::serving(RULES.as_bytes());
        let f = fixture(downloader.clone(), Encoding::Identity);
        put_local(&f.store, RULES, &format_date(Utc::now())).await;
        let updater = Arc::new(f.updater);

        let handle = Arc::clone(&updater).spawn(Duration::from_secs(3600));
        handle.trigger();

        tokio::time::timeout(Duration::from_secs(2), async {
            while downloader.calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        handle.shutdown().await;
        assert!(f.blocklist.is_blocked("example.com"));
    }
}
