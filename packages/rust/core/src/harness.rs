//! Checkpointed harvest runs.
//!
//! A run walks its query keys in order, merging each fetched page into the
//! record store and optionally enriching new records. Progress is written to
//! a checkpoint after every batch and at every key end so an interrupted run
//! can resume where it stopped:
//!
//! `idle → running → (checkpointed)* → completed | failed`
//!
//! A key that exhausts its retry budget is recorded and skipped. A store or
//! checkpoint failure halts the run without advancing the checkpoint.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use leadharvest_fetcher::{DirectorySource, Fetcher, WalkedPage};
use leadharvest_shared::{
    CURRENT_CHECKPOINT_VERSION, Checkpoint, CheckpointPhase, HarvestError, Provenance,
    QualityConfig, RawRecord, Record, RecordStore, Result, RunCounts, RunType,
};
use leadharvest_storage::CheckpointStore;

use crate::dedup::{MergeOutcome, RecordSet, collapse_batch};
use crate::enrichment::EnrichmentCache;
use crate::quality;

// ---------------------------------------------------------------------------
// Key space
// ---------------------------------------------------------------------------

/// Full-sweep query keys: each letter, then the letter followed by every
/// lowercase letter (`A, Aa … Az, B, …`). Empty `letters` means A-Z.
pub fn generate_prefixes(letters: &[char]) -> Vec<String> {
    let letters: Vec<char> = if letters.is_empty() {
        ('A'..='Z').collect()
    } else {
        normalize_letters(letters)
    };

    let mut keys = Vec::with_capacity(letters.len() * 27);
    for letter in letters {
        keys.push(letter.to_string());
        keys.extend(('a'..='z').map(|c| format!("{letter}{c}")));
    }
    keys
}

/// Uppercased, sorted, deduplicated ASCII letters.
fn normalize_letters(letters: &[char]) -> Vec<char> {
    let mut letters: Vec<char> = letters
        .iter()
        .filter(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    letters.sort_unstable();
    letters.dedup();
    letters
}

/// A worker's slice of the key space: keys at positions `index mod count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub index: u32,
    pub count: u32,
}

impl Shard {
    pub fn new(index: u32, count: u32) -> Result<Self> {
        if count == 0 || index >= count {
            return Err(HarvestError::validation(format!(
                "invalid shard {index}/{count}: need 0 <= index < count"
            )));
        }
        Ok(Self { index, count })
    }

    pub fn owns(&self, position: usize) -> bool {
        position % self.count as usize == self.index as usize
    }
}

impl FromStr for Shard {
    type Err = HarvestError;

    /// Parses `i/n`.
    fn from_str(s: &str) -> Result<Self> {
        let (index, count) = s
            .split_once('/')
            .ok_or_else(|| HarvestError::validation(format!("invalid shard '{s}', expected i/n")))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| HarvestError::validation(format!("invalid shard '{s}', expected i/n")))
        };
        Self::new(parse(index)?, parse(count)?)
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}

/// Keep the keys owned by `shard` (all keys when unsharded).
pub fn shard_keys(keys: Vec<String>, shard: Option<Shard>) -> Vec<String> {
    match shard {
        None => keys,
        Some(shard) => keys
            .into_iter()
            .enumerate()
            .filter(|(i, _)| shard.owns(*i))
            .map(|(_, k)| k)
            .collect(),
    }
}

/// Checkpoint namespace: `full`, `incremental`, or `full-shard-0-of-4`.
pub fn scope_name(run_type: RunType, shard: Option<Shard>) -> String {
    match shard {
        None => run_type.as_str().to_string(),
        Some(s) => format!("{}-shard-{}-of-{}", run_type.as_str(), s.index, s.count),
    }
}

// ---------------------------------------------------------------------------
// Options, state & report
// ---------------------------------------------------------------------------

/// Parameters of one harvest run.
#[derive(Debug, Clone)]
pub struct HarvestOptions {
    pub run_type: RunType,
    /// Continue from the scope's checkpoint, if a usable one exists.
    pub resume: bool,
    /// Restrict keys to these initial letters.
    pub letters: Vec<char>,
    pub shard: Option<Shard>,
    /// Enrich records that have no email yet.
    pub enrich: bool,
    /// Processed records between checkpoints.
    pub batch_size: usize,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self {
            run_type: RunType::Full,
            resume: false,
            letters: Vec::new(),
            shard: None,
            enrich: true,
            batch_size: 50,
        }
    }
}

impl HarvestOptions {
    pub fn scope(&self) -> String {
        scope_name(self.run_type, self.shard)
    }

    /// Whether a completed run covers the entire key space.
    fn is_complete_sweep(&self) -> bool {
        self.run_type == RunType::Full && self.shard.is_none() && self.letters.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Checkpointed,
    Completed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Checkpointed => "checkpointed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    /// Halted; `checkpoint` is the last one written, the resume point.
    Failed {
        cause: String,
        checkpoint: Option<Checkpoint>,
    },
}

/// Summary of a run, printed by the CLI.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_type: RunType,
    pub scope: String,
    pub outcome: RunOutcome,
    pub counts: RunCounts,
    pub failed_keys: Vec<String>,
    pub stale_marked: u64,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}

/// Progress callback for long-running harvests.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called before walking a query key (`current` is 1-based).
    fn key_started(&self, key: &str, current: usize, total: usize);
    /// Called after each page is merged.
    fn page_processed(&self, key: &str, counts: &RunCounts);
    /// Called when the run completes or halts.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn key_started(&self, _key: &str, _current: usize, _total: usize) {}
    fn page_processed(&self, _key: &str, _counts: &RunCounts) {}
    fn done(&self, _report: &RunReport) {}
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Mutable bookkeeping for one run.
struct RunContext {
    run_type: RunType,
    scope: String,
    letters: Vec<char>,
    run_started_at: DateTime<Utc>,
    counts: RunCounts,
    failed_keys: Vec<String>,
    last_key: Option<String>,
    last_checkpoint: Option<Checkpoint>,
    processed_at_checkpoint: u64,
}

/// Where a resumed run picks up.
struct ResumePoint {
    key: String,
    cursor: Option<String>,
    key_done: bool,
}

/// Drives fetch → dedup → persist → enrich over a run's keys.
pub struct Harness<S: ?Sized> {
    fetcher: Arc<Fetcher<S>>,
    store: Arc<dyn RecordStore>,
    checkpoints: CheckpointStore,
    enrichment: Option<EnrichmentCache>,
    weights: QualityConfig,
    state: RunState,
}

impl<S: DirectorySource + ?Sized> Harness<S> {
    pub fn new(
        fetcher: Arc<Fetcher<S>>,
        store: Arc<dyn RecordStore>,
        checkpoints: CheckpointStore,
        weights: &QualityConfig,
    ) -> Self {
        Self {
            fetcher,
            store,
            checkpoints,
            enrichment: None,
            weights: weights.clone(),
            state: RunState::Idle,
        }
    }

    pub fn with_enrichment(mut self, cache: EnrichmentCache) -> Self {
        self.enrichment = Some(cache);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Execute one run. Halting conditions are reported in the returned
    /// [`RunReport`]; only invalid options produce an `Err`.
    #[instrument(skip_all, fields(run_type = %options.run_type, scope = %options.scope()))]
    pub async fn run(
        &mut self,
        options: &HarvestOptions,
        progress: &dyn ProgressReporter,
    ) -> Result<RunReport> {
        if options.batch_size == 0 {
            return Err(HarvestError::validation("batch size must be at least 1"));
        }
        let start = Instant::now();
        self.state = RunState::Running;

        let mut ctx = RunContext {
            run_type: options.run_type,
            scope: options.scope(),
            letters: normalize_letters(&options.letters),
            run_started_at: Utc::now(),
            counts: RunCounts::default(),
            failed_keys: Vec::new(),
            last_key: None,
            last_checkpoint: None,
            processed_at_checkpoint: 0,
        };
        let resume = if options.resume {
            self.load_resume_point(&mut ctx)
        } else {
            None
        };

        progress.phase("Planning query keys");
        let keys = match self.plan_keys(options).await {
            Ok(keys) => keys,
            Err(e) => return Ok(self.fail(ctx, e, start, progress)),
        };
        let pending: Vec<(String, Option<String>)> = keys
            .into_iter()
            .filter_map(|key| match &resume {
                Some(r) if key < r.key => None,
                Some(r) if key == r.key && r.key_done => None,
                Some(r) if key == r.key => Some((key, r.cursor.clone())),
                _ => Some((key, None)),
            })
            .collect();
        info!(keys = pending.len(), "starting harvest");

        progress.phase("Harvesting");
        let total = pending.len();
        for (i, (key, cursor)) in pending.into_iter().enumerate() {
            progress.key_started(&key, i + 1, total);
            if let Err(e) = self.run_key(&key, cursor, options, &mut ctx, progress).await {
                return Ok(self.fail(ctx, e, start, progress));
            }
        }

        let mut stale_marked = 0;
        if options.is_complete_sweep() && ctx.failed_keys.is_empty() {
            progress.phase("Marking stale records");
            match self.store.mark_stale_before(ctx.run_started_at).await {
                Ok(n) => stale_marked = n,
                Err(e) => return Ok(self.fail(ctx, e, start, progress)),
            }
        }

        if let Some(key) = ctx.last_key.clone() {
            if let Err(e) = self.save_checkpoint(&mut ctx, &key, None, true, CheckpointPhase::Completed) {
                return Ok(self.fail(ctx, e, start, progress));
            }
        }

        self.state = RunState::Completed;
        let report = RunReport {
            run_type: ctx.run_type,
            scope: ctx.scope,
            outcome: RunOutcome::Completed,
            counts: ctx.counts,
            failed_keys: ctx.failed_keys,
            stale_marked,
            elapsed: start.elapsed(),
        };
        info!(
            created = report.counts.created,
            updated = report.counts.updated,
            unchanged = report.counts.unchanged,
            enriched = report.counts.enriched,
            failed_keys = report.failed_keys.len(),
            stale = stale_marked,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "harvest complete"
        );
        progress.done(&report);
        Ok(report)
    }

    fn load_resume_point(&self, ctx: &mut RunContext) -> Option<ResumePoint> {
        let checkpoint = match self.checkpoints.load(&ctx.scope, ctx.run_type) {
            Some(cp) if cp.phase == CheckpointPhase::Completed => {
                info!(scope = %ctx.scope, "previous run completed, starting fresh");
                return None;
            }
            Some(cp) if cp.letters != ctx.letters => {
                warn!(
                    scope = %ctx.scope,
                    saved = ?cp.letters,
                    requested = ?ctx.letters,
                    "checkpoint letter filter differs, starting fresh"
                );
                return None;
            }
            Some(cp) => cp,
            None => {
                info!(scope = %ctx.scope, "no usable checkpoint, starting fresh");
                return None;
            }
        };

        info!(key = %checkpoint.key, cursor = ?checkpoint.cursor, "resuming from checkpoint");
        ctx.counts = checkpoint.counts.clone();
        ctx.failed_keys = checkpoint.failed_keys.clone();
        ctx.run_started_at = checkpoint.run_started_at;
        ctx.processed_at_checkpoint = checkpoint.counts.processed();
        let point = ResumePoint {
            key: checkpoint.key.clone(),
            cursor: checkpoint.cursor.clone(),
            key_done: checkpoint.key_done,
        };
        ctx.last_checkpoint = Some(checkpoint);
        Some(point)
    }

    async fn plan_keys(&self, options: &HarvestOptions) -> Result<Vec<String>> {
        let keys = match options.run_type {
            RunType::Full => generate_prefixes(&options.letters),
            RunType::Incremental => {
                let names = self.store.distinct_last_names().await?;
                if options.letters.is_empty() {
                    names
                } else {
                    names
                        .into_iter()
                        .filter(|n| {
                            n.chars().next().is_some_and(|c| {
                                options
                                    .letters
                                    .iter()
                                    .any(|l| l.eq_ignore_ascii_case(&c))
                            })
                        })
                        .collect()
                }
            }
        };
        Ok(shard_keys(keys, options.shard))
    }

    /// Walk one key to its end. Fetch failures mark the key failed; store and
    /// checkpoint failures are returned.
    async fn run_key(
        &mut self,
        key: &str,
        cursor: Option<String>,
        options: &HarvestOptions,
        ctx: &mut RunContext,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        ctx.last_key = Some(key.to_string());
        let fetcher = Arc::clone(&self.fetcher);
        let mut walk = fetcher.walk(key, cursor);

        loop {
            let WalkedPage {
                records,
                next_cursor,
                ..
            } = match walk.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) => {
                    warn!(key, error = %e, "query key failed, skipping");
                    ctx.failed_keys.push(key.to_string());
                    break;
                }
            };

            self.process_page(records, options.enrich, &mut ctx.counts)
                .await?;
            ctx.counts.pages += 1;
            progress.page_processed(key, &ctx.counts);

            let since = ctx.counts.processed() - ctx.processed_at_checkpoint;
            if let Some(next) = next_cursor {
                if since >= options.batch_size as u64 {
                    self.save_checkpoint(ctx, key, Some(next), false, CheckpointPhase::InProgress)?;
                }
            }
        }

        self.save_checkpoint(ctx, key, None, true, CheckpointPhase::InProgress)
    }

    /// Merge and persist one page, then enrich records still lacking an email.
    async fn process_page(
        &self,
        raws: Vec<RawRecord>,
        enrich: bool,
        counts: &mut RunCounts,
    ) -> Result<()> {
        let batch = collapse_batch(raws);
        if batch.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let ids: Vec<String> = batch.iter().map(|r| r.external_id.clone()).collect();

        let existing = self.store.load_records(&ids).await?;
        let prior: HashMap<String, String> = existing
            .iter()
            .map(|r| (r.external_id.clone(), r.content_hash.clone()))
            .collect();
        let mut set = RecordSet::from_records(existing);
        let mut touched = Vec::new();

        for raw in batch {
            let id = raw.external_id.clone();
            let outcome = set.merge(raw.clone(), now);
            let Some(record) = set.get_mut(&id) else {
                continue;
            };

            let stored = match &outcome {
                MergeOutcome::Unchanged => {
                    touched.push(id);
                    tally(counts, &outcome);
                    continue;
                }
                MergeOutcome::Created => {
                    record.quality_score = quality::score(record, &self.weights);
                    self.store.insert_record(record).await?
                }
                MergeOutcome::Updated(_) => {
                    record.quality_score = quality::score(record, &self.weights);
                    match prior.get(&id) {
                        Some(expected) => self.store.update_record_if(record, expected).await?,
                        None => false,
                    }
                }
            };

            if stored {
                if let MergeOutcome::Updated(events) = &outcome {
                    self.store.append_change_events(events).await?;
                }
                tally(counts, &outcome);
            } else if let Some(current) = self.remerge(raw, now, counts, &mut touched).await? {
                set.insert(current);
            }
        }

        if !touched.is_empty() {
            self.store.touch_records(&touched, now).await?;
        }

        if enrich {
            self.enrich_page(&ids, &set, now, counts).await?;
        }
        Ok(())
    }

    /// Retry a lost write once against the freshly stored record. Returns
    /// the merged record when the retry went through.
    async fn remerge(
        &self,
        raw: RawRecord,
        now: DateTime<Utc>,
        counts: &mut RunCounts,
        touched: &mut Vec<String>,
    ) -> Result<Option<Record>> {
        let id = raw.external_id.clone();
        let current = self.store.get_record(&id).await?;
        let expected = current.as_ref().map(|r| r.content_hash.clone());
        let mut set = RecordSet::from_records(current);
        let outcome = set.merge(raw, now);
        let Some(record) = set.get_mut(&id) else {
            return Ok(None);
        };

        let stored = match (&outcome, expected) {
            (MergeOutcome::Unchanged, _) => {
                touched.push(id.clone());
                true
            }
            (MergeOutcome::Created, _) => {
                record.quality_score = quality::score(record, &self.weights);
                self.store.insert_record(record).await?
            }
            (MergeOutcome::Updated(_), Some(expected)) => {
                record.quality_score = quality::score(record, &self.weights);
                self.store.update_record_if(record, &expected).await?
            }
            (MergeOutcome::Updated(_), None) => false,
        };

        if !stored {
            warn!(id = %id, "concurrent write won twice, counting conflict");
            counts.conflicts += 1;
            return Ok(None);
        }
        if let MergeOutcome::Updated(events) = &outcome {
            self.store.append_change_events(events).await?;
        }
        debug!(id = %id, "write succeeded after re-merge");
        tally(counts, &outcome);
        Ok(Some(record.clone()))
    }

    async fn enrich_page(
        &self,
        ids: &[String],
        set: &RecordSet,
        now: DateTime<Utc>,
        counts: &mut RunCounts,
    ) -> Result<()> {
        let Some(cache) = &self.enrichment else {
            return Ok(());
        };
        for id in ids {
            let Some(record) = set.get(id).filter(|r| r.needs_email()) else {
                continue;
            };
            let mut record = record.clone();
            let provenance = cache.enrich(&mut record, now).await?;
            self.store
                .update_contacts(
                    id,
                    record.email.as_ref(),
                    record.phone.as_ref(),
                    record.quality_score,
                )
                .await?;
            if provenance == Provenance::NotFound {
                counts.unresolved += 1;
            } else {
                counts.enriched += 1;
            }
        }
        Ok(())
    }

    fn save_checkpoint(
        &mut self,
        ctx: &mut RunContext,
        key: &str,
        cursor: Option<String>,
        key_done: bool,
        phase: CheckpointPhase,
    ) -> Result<()> {
        let checkpoint = Checkpoint {
            schema_version: CURRENT_CHECKPOINT_VERSION,
            run_type: ctx.run_type,
            scope: ctx.scope.clone(),
            key: key.to_string(),
            letters: ctx.letters.clone(),
            cursor,
            key_done,
            phase,
            counts: ctx.counts.clone(),
            failed_keys: ctx.failed_keys.clone(),
            run_started_at: ctx.run_started_at,
            updated_at: Utc::now(),
        };
        self.checkpoints.save(&checkpoint)?;
        debug!(key, cursor = ?checkpoint.cursor, key_done, "checkpoint written");

        ctx.processed_at_checkpoint = ctx.counts.processed();
        ctx.last_checkpoint = Some(checkpoint);
        self.state = RunState::Checkpointed;
        Ok(())
    }

    fn fail(
        &mut self,
        ctx: RunContext,
        cause: HarvestError,
        start: Instant,
        progress: &dyn ProgressReporter,
    ) -> RunReport {
        self.state = RunState::Failed;
        error!(
            error = %cause,
            resume_key = ctx.last_checkpoint.as_ref().map(|c| c.key.as_str()),
            "harvest halted"
        );
        let report = RunReport {
            run_type: ctx.run_type,
            scope: ctx.scope,
            outcome: RunOutcome::Failed {
                cause: cause.to_string(),
                checkpoint: ctx.last_checkpoint,
            },
            counts: ctx.counts,
            failed_keys: ctx.failed_keys,
            stale_marked: 0,
            elapsed: start.elapsed(),
        };
        progress.done(&report);
        report
    }
}

fn tally(counts: &mut RunCounts, outcome: &MergeOutcome) {
    match outcome {
        MergeOutcome::Created => counts.created += 1,
        MergeOutcome::Updated(events) => {
            counts.updated += 1;
            counts.change_events += events.len() as u64;
        }
        MergeOutcome::Unchanged => counts.unchanged += 1,
    }
}
