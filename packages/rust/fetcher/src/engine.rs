//! Paced, retrying fetch engine over a [`DirectorySource`].
//!
//! Every request issued through a [`Fetcher`] waits out the minimum
//! inter-request delay first. Transient failures are retried under the
//! [`RetryPolicy`]; anything else, or an exhausted budget, fails the key
//! with [`HarvestError::KeyFailed`]. The fetcher never touches persisted state.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use leadharvest_shared::{HarvestError, RawRecord, Result};

use crate::retry::RetryPolicy;
use crate::source::{DetailContact, DetailSource, DirectorySource, Page};

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Wraps a source with pacing and bounded retry.
pub struct Fetcher<S: ?Sized> {
    source: Arc<S>,
    policy: RetryPolicy,
    min_delay: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl<S: ?Sized> Fetcher<S> {
    pub fn new(source: Arc<S>, min_delay: Duration, policy: RetryPolicy) -> Self {
        Self {
            source,
            policy,
            min_delay,
            last_request: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Wait until `min_delay` has passed since the previous request.
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_delay {
                tokio::time::sleep(self.min_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Run `op` under pacing and the retry policy.
    async fn with_retry<T, F, Fut>(&self, key: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.pace().await;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        key,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient fetch failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(HarvestError::KeyFailed {
                        key: key.to_string(),
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }
}

impl<S: DirectorySource + ?Sized> Fetcher<S> {
    /// Fetch one page of `key`.
    pub async fn fetch_page(&self, key: &str, cursor: Option<&str>) -> Result<Page> {
        debug!(source = self.source.name(), key, ?cursor, "fetching page");
        self.with_retry(key, || self.source.fetch_page(key, cursor))
            .await
    }

    /// Iterate the pages of `key`, starting at `start` (`None` = first page).
    pub fn walk(&self, key: &str, start: Option<String>) -> KeyWalk<'_, S> {
        KeyWalk::new(self, key, start)
    }
}

impl<S: DetailSource + ?Sized> Fetcher<S> {
    /// Fetch the detail view of one listing.
    pub async fn fetch_detail(&self, external_id: &str) -> Result<Option<DetailContact>> {
        self.with_retry(external_id, || self.source.fetch_detail(external_id))
            .await
    }
}

// ---------------------------------------------------------------------------
// KeyWalk
// ---------------------------------------------------------------------------

/// A page yielded by [`KeyWalk`].
#[derive(Debug, Clone, PartialEq)]
pub struct WalkedPage {
    /// Cursor this page was fetched with.
    pub cursor: Option<String>,
    pub records: Vec<RawRecord>,
    /// Cursor to resume from; `None` once the key is exhausted.
    pub next_cursor: Option<String>,
}

/// Cursor-ordered page iteration for one key, with loop detection.
pub struct KeyWalk<'a, S: ?Sized> {
    fetcher: &'a Fetcher<S>,
    key: String,
    cursor: Option<String>,
    seen: HashSet<Option<String>>,
    done: bool,
    loop_detected: bool,
}

impl<'a, S: DirectorySource + ?Sized> KeyWalk<'a, S> {
    fn new(fetcher: &'a Fetcher<S>, key: &str, start: Option<String>) -> Self {
        let mut seen = HashSet::new();
        seen.insert(start.clone());
        Self {
            fetcher,
            key: key.to_string(),
            cursor: start,
            seen,
            done: false,
            loop_detected: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The walk ended because a cursor repeated.
    pub fn loop_detected(&self) -> bool {
        self.loop_detected
    }

    /// Fetch the next page, or `None` once the key is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<WalkedPage>> {
        if self.done {
            return Ok(None);
        }

        let cursor = self.cursor.clone();
        let page = match self.fetcher.fetch_page(&self.key, cursor.as_deref()).await {
            Ok(page) => page,
            Err(err) => {
                self.done = true;
                return Err(err);
            }
        };

        let next = match page.next_cursor {
            Some(next) if !self.seen.insert(Some(next.clone())) => {
                warn!(
                    key = %self.key,
                    cursor = %next,
                    "pagination cursor repeated, ending key early"
                );
                self.loop_detected = true;
                None
            }
            other => other,
        };

        self.done = next.is_none();
        self.cursor = next.clone();

        Ok(Some(WalkedPage {
            cursor,
            records: page.records,
            next_cursor: next,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use leadharvest_shared::RecordStatus;

    use super::*;

    fn raw(id: &str) -> RawRecord {
        RawRecord {
            external_id: id.into(),
            first_name: "Jane".into(),
            middle_name: String::new(),
            last_name: "Doe".into(),
            aka: None,
            organization: "Acme Realty".into(),
            city: "Calgary".into(),
            sector: None,
            status: RecordStatus::Licensed,
        }
    }

    /// Scripted source: pages keyed by (key, cursor), plus a failure budget.
    #[derive(Default)]
    struct ScriptedSource {
        pages: HashMap<(String, Option<String>), Page>,
        failures_left: AtomicU32,
        failure: Option<fn() -> HarvestError>,
        calls: AtomicU32,
    }

    impl ScriptedSource {
        fn page(mut self, key: &str, cursor: Option<&str>, ids: &[&str], next: Option<&str>) -> Self {
            self.pages.insert(
                (key.to_string(), cursor.map(String::from)),
                Page {
                    records: ids.iter().map(|id| raw(id)).collect(),
                    next_cursor: next.map(String::from),
                },
            );
            self
        }

        fn failing(mut self, times: u32, failure: fn() -> HarvestError) -> Self {
            self.failures_left = AtomicU32::new(times);
            self.failure = Some(failure);
            self
        }
    }

    #[async_trait]
    impl DirectorySource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch_page(&self, key: &str, cursor: Option<&str>) -> Result<Page> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(make) = self.failure {
                if self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(make());
                }
            }
            Ok(self
                .pages
                .get(&(key.to_string(), cursor.map(String::from)))
                .cloned()
                .unwrap_or_default())
        }
    }

    fn fetcher(source: ScriptedSource, attempts: u32) -> Fetcher<ScriptedSource> {
        Fetcher::new(
            Arc::new(source),
            Duration::ZERO,
            RetryPolicy::immediate(attempts),
        )
    }

    #[tokio::test]
    async fn walks_pages_in_cursor_order() {
        let source = ScriptedSource::default()
            .page("A", None, &["1", "2"], Some("2"))
            .page("A", Some("2"), &["3"], Some("3"))
            .page("A", Some("3"), &["4"], None);
        let f = fetcher(source, 1);

        let mut walk = f.walk("A", None);
        let mut ids = Vec::new();
        let mut cursors = Vec::new();
        while let Some(page) = walk.next_page().await.unwrap() {
            cursors.push(page.cursor.clone());
            ids.extend(page.records.into_iter().map(|r| r.external_id));
        }
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
        assert_eq!(cursors, vec![None, Some("2".into()), Some("3".into())]);
        assert!(!walk.loop_detected());
    }

    #[tokio::test]
    async fn walk_resumes_from_cursor() {
        let source = ScriptedSource::default()
            .page("A", None, &["1"], Some("2"))
            .page("A", Some("2"), &["2"], None);
        let f = fetcher(source, 1);

        let mut walk = f.walk("A", Some("2".into()));
        let page = walk.next_page().await.unwrap().unwrap();
        assert_eq!(page.records[0].external_id, "2");
        assert!(walk.next_page().await.unwrap().is_none());
        assert_eq!(f.source().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_cursor_ends_key() {
        let source = ScriptedSource::default()
            .page("A", None, &["1"], Some("2"))
            .page("A", Some("2"), &["2"], Some("2"));
        let f = fetcher(source, 1);

        let mut walk = f.walk("A", None);
        assert!(walk.next_page().await.unwrap().is_some());
        let second = walk.next_page().await.unwrap().unwrap();
        assert_eq!(second.next_cursor, None);
        assert!(walk.next_page().await.unwrap().is_none());
        assert!(walk.loop_detected());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let source = ScriptedSource::default()
            .page("A", None, &["1"], None)
            .failing(2, || HarvestError::Network("reset".into()));
        let f = fetcher(source, 4);

        let page = f.fetch_page("A", None).await.unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(f.source().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_key() {
        let source = ScriptedSource::default()
            .failing(10, || HarvestError::Blocked("captcha".into()));
        let f = fetcher(source, 3);

        let err = f.fetch_page("Ab", None).await.unwrap_err();
        match err {
            HarvestError::KeyFailed { key, attempts, .. } => {
                assert_eq!(key, "Ab");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected KeyFailed, got {other:?}"),
        }
        assert_eq!(f.source().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_failure_is_not_retried() {
        let source = ScriptedSource::default().failing(10, || HarvestError::Http {
            url: "u".into(),
            status: 404,
        });
        let f = fetcher(source, 4);

        let err = f.fetch_page("A", None).await.unwrap_err();
        assert!(matches!(err, HarvestError::KeyFailed { attempts: 1, .. }));
        assert_eq!(f.source().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pacing_spaces_requests() {
        let source = ScriptedSource::default().page("A", None, &["1"], None);
        let f = Fetcher::new(
            Arc::new(source),
            Duration::from_millis(40),
            RetryPolicy::immediate(1),
        );

        let start = Instant::now();
        for _ in 0..3 {
            f.fetch_page("A", None).await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}
