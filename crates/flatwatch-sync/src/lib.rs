//! Pipeline orchestration: ingest cycle, matching pass, dispatcher and scheduler.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flatwatch_adapters::{
    AdapterContext, BackoffPolicy, DryRunTransport, FixtureListingSource, ListingSource, NotificationTransport,
    TelegramConfig, TelegramTransport, TokenBucket, TransportError, TransportErrorKind,
};
use flatwatch_core::{
    compose_notification, escape_html, match_candidates, Listing, ListingId, MatchPair, Notification, Source,
};
use flatwatch_storage::{IngestOutcome, PassRecord, Store, StoreError, StoreResult, WatermarkAdvance};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "flatwatch-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source: Source,
    pub enabled: bool,
    /// Captured bundle replayed by the fixture source, relative to the workspace.
    #[serde(default)]
    pub fixture: Option<PathBuf>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

impl SourceConfig {
    fn fixture_path(&self, workspace_root: &Path) -> PathBuf {
        match &self.fixture {
            Some(path) => workspace_root.join(path),
            None => workspace_root
                .join("fixtures")
                .join(self.source.slug())
                .join("listings.json"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub workspace_root: PathBuf,
    pub telegram_bot_token: Option<String>,
    pub telegram_api_base: String,
    pub http_timeout_secs: u64,
    pub send_delay: Duration,
    pub sends_per_second: u32,
    pub permanent_failure_limit: u32,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub slow_cycle: Duration,
    /// Chat that receives operator alerts; alerts are only logged when unset.
    pub admin_chat_id: Option<i64>,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://flatwatch.db".to_string()),
            workspace_root: std::env::var("FLATWATCH_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
            telegram_api_base: std::env::var("TELEGRAM_API_BASE")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            http_timeout_secs: env_parse("FLATWATCH_HTTP_TIMEOUT_SECS", 20),
            send_delay: Duration::from_millis(env_parse("FLATWATCH_SEND_DELAY_MS", 50)),
            sends_per_second: env_parse("FLATWATCH_SENDS_PER_SECOND", 20),
            permanent_failure_limit: env_parse("FLATWATCH_PERMANENT_FAILURE_LIMIT", 3),
            scheduler_enabled: std::env::var("FLATWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("FLATWATCH_SYNC_CRON").unwrap_or_else(|_| "0 * * * * *".to_string()),
            slow_cycle: Duration::from_secs(env_parse("FLATWATCH_SLOW_CYCLE_SECS", 180)),
            admin_chat_id: std::env::var("FLATWATCH_ADMIN_CHAT_ID")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
        }
    }

    /// Telegram when a bot token is configured, otherwise a logging dry run.
    pub fn build_transport(&self) -> Result<Arc<dyn NotificationTransport>> {
        match &self.telegram_bot_token {
            Some(token) => {
                let transport = TelegramTransport::new(TelegramConfig {
                    api_base: self.telegram_api_base.clone(),
                    bot_token: token.clone(),
                    timeout: Duration::from_secs(self.http_timeout_secs),
                    backoff: BackoffPolicy::default(),
                })?;
                Ok(Arc::new(transport))
            }
            None => {
                warn!("TELEGRAM_BOT_TOKEN not set; notifications are logged, not sent");
                Ok(Arc::new(DryRunTransport))
            }
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            send_delay: self.send_delay,
            sends_per_second: self.sends_per_second,
            permanent_failure_limit: self.permanent_failure_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRecorded,
}

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Sent,
    Skipped(SkipReason),
    /// No ledger row was written; the pair is retried by a later pass unless the
    /// content itself was rejected.
    Failed(TransportError),
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub send_delay: Duration,
    pub sends_per_second: u32,
    pub permanent_failure_limit: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            send_delay: Duration::from_millis(50),
            sends_per_second: 20,
            permanent_failure_limit: 3,
        }
    }
}

/// Sends one notification per pair and records it in the ledger.
pub struct Dispatcher {
    store: Store,
    transport: Arc<dyn NotificationTransport>,
    pacer: TokenBucket,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(store: Store, transport: Arc<dyn NotificationTransport>, config: DispatcherConfig) -> Self {
        Self {
            store,
            transport,
            pacer: TokenBucket::per_second(config.sends_per_second),
            config,
        }
    }

    /// Transport failures come back as `Failed`; only storage errors are `Err`.
    pub async fn dispatch(&self, pair: &MatchPair, listing: &Listing) -> StoreResult<DispatchOutcome> {
        if self.store.is_delivered(pair).await? {
            return Ok(DispatchOutcome::Skipped(SkipReason::AlreadyRecorded));
        }

        let notification = compose_notification(listing);
        self.pacer.take().await;
        let sent = self.transport.send(pair.user_id, &notification).await;
        if !self.config.send_delay.is_zero() {
            tokio::time::sleep(self.config.send_delay).await;
        }

        match sent {
            Ok(()) => {
                if !self.store.record_delivery(pair, Utc::now()).await? {
                    debug!(user_id = pair.user_id, listing_id = %pair.listing_id, "ledger row already written concurrently");
                }
                self.store.reset_permanent_failures(pair.user_id).await?;
                Ok(DispatchOutcome::Sent)
            }
            Err(err) => {
                warn!(
                    user_id = pair.user_id,
                    listing_id = %pair.listing_id,
                    kind = ?err.kind,
                    error = %err,
                    "delivery failed; pair stays eligible"
                );
                if err.is_permanent() {
                    if let Some(tally) = self
                        .store
                        .record_permanent_failure(pair.user_id, self.config.permanent_failure_limit)
                        .await?
                    {
                        if tally.searching_disabled {
                            warn!(
                                user_id = pair.user_id,
                                failures = tally.consecutive,
                                "recipient unreachable; searching disabled"
                            );
                        }
                    }
                }
                Ok(DispatchOutcome::Failed(err))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub watermark: DateTime<Utc>,
    pub candidates: usize,
    pub subscribers: usize,
    pub matched: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub expired_subscribers: Vec<i64>,
    pub incomplete_listings: usize,
    /// Pass start, or the creation time of the oldest listing left undelivered.
    pub advanced_to: DateTime<Utc>,
    pub watermark_advance: WatermarkAdvance,
}

/// One matching pass: watermark, candidates, matching, dispatch, advance.
pub struct DispatchPipeline {
    store: Store,
    dispatcher: Dispatcher,
}

impl DispatchPipeline {
    pub fn new(store: Store, dispatcher: Dispatcher) -> Self {
        Self { store, dispatcher }
    }

    pub async fn run_pass(&self) -> Result<PassSummary> {
        self.run_pass_at(Utc::now()).await
    }

    /// Any error returns before the watermark is touched.
    pub async fn run_pass_at(&self, pass_start: DateTime<Utc>) -> Result<PassSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("dispatch_pass", %run_id);
        self.pass(run_id, pass_start).instrument(span).await
    }

    async fn pass(&self, run_id: Uuid, pass_start: DateTime<Utc>) -> Result<PassSummary> {
        let watermark = self
            .store
            .read_watermark(pass_start)
            .await
            .context("reading run watermark")?;
        let candidates = self
            .store
            .listings_created_since(watermark.at)
            .await
            .context("loading candidate listings")?;
        let subscribers = self
            .store
            .searching_subscribers()
            .await
            .context("loading searching subscribers")?;
        let delivered = self
            .store
            .delivered_pairs_since(watermark.at)
            .await
            .context("loading delivery ledger")?;

        let mut report = match_candidates(&candidates, &subscribers, &delivered, pass_start);

        for user_id in &report.expired_subscribers {
            self.store
                .set_searching(*user_id, false)
                .await
                .with_context(|| format!("stopping search for expired subscriber {user_id}"))?;
            info!(user_id, "subscription expired; searching stopped");
        }

        let by_id: HashMap<&ListingId, &Listing> = candidates.iter().map(|l| (&l.id, l)).collect();
        report
            .pairs
            .sort_by(|a, b| (a.user_id, &a.listing_id).cmp(&(b.user_id, &b.listing_id)));

        let (mut sent, mut skipped, mut failed) = (0usize, 0usize, 0usize);
        // Oldest listing with an undelivered pair; the next window must still include it.
        let mut held_back: Option<DateTime<Utc>> = None;
        for pair in &report.pairs {
            let Some(listing) = by_id.get(&pair.listing_id) else {
                continue;
            };
            let outcome = self
                .dispatcher
                .dispatch(pair, listing)
                .await
                .with_context(|| format!("dispatching {} to {}", pair.listing_id, pair.user_id))?;
            match outcome {
                DispatchOutcome::Sent => sent += 1,
                DispatchOutcome::Skipped(_) => skipped += 1,
                DispatchOutcome::Failed(err) => {
                    failed += 1;
                    // Resending refused content fails the same way; it must not pin the window.
                    if err.kind != TransportErrorKind::Rejected {
                        held_back = Some(held_back.map_or(listing.created_at, |at| at.min(listing.created_at)));
                    }
                }
            }
        }

        let advanced_to = held_back.map_or(pass_start, |at| at.min(pass_start));
        let watermark_advance = self
            .store
            .advance_watermark(&watermark, advanced_to)
            .await
            .context("advancing run watermark")?;
        if watermark_advance == WatermarkAdvance::Superseded {
            info!("watermark already advanced by a concurrent pass");
        }

        let summary = PassSummary {
            run_id,
            started_at: pass_start,
            finished_at: Utc::now(),
            watermark: watermark.at,
            candidates: candidates.len(),
            subscribers: subscribers.len(),
            matched: report.pairs.len(),
            sent,
            skipped,
            failed,
            expired_subscribers: report.expired_subscribers,
            incomplete_listings: report.incomplete_listings.len(),
            advanced_to,
            watermark_advance,
        };

        self.store
            .record_pass(&PassRecord {
                run_id,
                started_at: summary.started_at,
                finished_at: summary.finished_at,
                watermark: summary.watermark,
                candidates: summary.candidates as u64,
                subscribers: summary.subscribers as u64,
                matched: summary.matched as u64,
                sent: summary.sent as u64,
                skipped: summary.skipped as u64,
                failed: summary.failed as u64,
                watermark_advanced: watermark_advance == WatermarkAdvance::Advanced,
            })
            .await
            .context("recording pass")?;

        info!(
            candidates = summary.candidates,
            subscribers = summary.subscribers,
            matched = summary.matched,
            sent,
            skipped,
            failed,
            "dispatch pass finished"
        );
        Ok(summary)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceIngestReport {
    pub source: Option<Source>,
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestCycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceIngestReport>,
}

impl IngestCycleSummary {
    pub fn inserted(&self) -> usize {
        self.sources.iter().map(|s| s.inserted).sum()
    }

    pub fn failed_sources(&self) -> Vec<Source> {
        self.sources
            .iter()
            .filter(|s| s.error.is_some())
            .filter_map(|s| s.source)
            .collect()
    }
}

/// Pulls drafts from every enabled source through the dedup gate.
pub struct IngestPipeline {
    store: Store,
    sources: Vec<Box<dyn ListingSource>>,
}

impl IngestPipeline {
    pub fn new(store: Store, sources: Vec<Box<dyn ListingSource>>) -> Self {
        Self { store, sources }
    }

    pub fn from_registry(store: Store, registry: &SourceRegistry, workspace_root: &Path) -> Self {
        let sources = registry
            .enabled()
            .map(|cfg| {
                Box::new(FixtureListingSource::new(cfg.source, cfg.fixture_path(workspace_root)))
                    as Box<dyn ListingSource>
            })
            .collect();
        Self::new(store, sources)
    }

    /// A failing source is reported and skipped; the others still run.
    pub async fn run_cycle(&self) -> IngestCycleSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let ctx = AdapterContext::new(run_id);
        let mut reports = Vec::with_capacity(self.sources.len());

        for adapter in &self.sources {
            let source = adapter.source();
            let span = info_span!("ingest_source", %run_id, %source);
            let report = self.ingest_source(adapter.as_ref(), &ctx).instrument(span).await;
            reports.push(report);
        }

        let summary = IngestCycleSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources: reports,
        };
        info!(
            %run_id,
            sources = summary.sources.len(),
            inserted = summary.inserted(),
            failed_sources = summary.failed_sources().len(),
            "ingest cycle finished"
        );
        summary
    }

    async fn ingest_source(&self, adapter: &dyn ListingSource, ctx: &AdapterContext) -> SourceIngestReport {
        let mut report = SourceIngestReport {
            source: Some(adapter.source()),
            ..Default::default()
        };

        let drafts = match adapter.fetch_listings(ctx).await {
            Ok(drafts) => drafts,
            Err(err) => {
                warn!(error = %err, "source failed; skipping for this cycle");
                report.error = Some(err.to_string());
                return report;
            }
        };
        report.fetched = drafts.len();

        for draft in drafts {
            let listing_id = draft.id.clone();
            match self.store.ingest(draft).await {
                Ok(IngestOutcome::Inserted) => report.inserted += 1,
                Ok(IngestOutcome::AlreadyPresent) => report.duplicates += 1,
                Err(StoreError::InvalidListing(reason)) => {
                    debug!(%listing_id, %reason, "draft rejected by dedup gate");
                    report.rejected += 1;
                }
                Err(err) => {
                    warn!(%listing_id, error = %err, "storage failure; abandoning source for this cycle");
                    report.error = Some(err.to_string());
                    break;
                }
            }
        }

        info!(
            fetched = report.fetched,
            inserted = report.inserted,
            duplicates = report.duplicates,
            "source ingested"
        );
        report
    }
}

/// Out-of-band messages to the operator's chat about the pipeline itself.
#[derive(Clone)]
pub struct OperatorAlerts {
    transport: Arc<dyn NotificationTransport>,
    chat_id: Option<i64>,
}

impl OperatorAlerts {
    pub fn new(transport: Arc<dyn NotificationTransport>, chat_id: Option<i64>) -> Self {
        Self { transport, chat_id }
    }

    /// Never fails the caller: an undeliverable alert is only logged.
    pub async fn alert(&self, message: &str) {
        warn!(alert = message, "operator alert");
        let Some(chat_id) = self.chat_id else {
            return;
        };
        let notification = Notification::Text {
            body: format!("⚠️ <b>flatwatch</b>\n{}", escape_html(message)),
        };
        if let Err(err) = self.transport.send(chat_id, &notification).await {
            warn!(chat_id, error = %err, "operator alert not delivered");
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub ingest: IngestCycleSummary,
    pub pass: PassSummary,
    pub elapsed_ms: u128,
}

/// Ingest cycle followed by a dispatch pass, optionally on a cron schedule.
pub struct SyncPipeline {
    config: SyncConfig,
    ingest: IngestPipeline,
    dispatch: DispatchPipeline,
    alerts: OperatorAlerts,
    cycle_lock: Mutex<()>,
}

impl SyncPipeline {
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let store = Store::connect(&config.database_url)
            .await
            .with_context(|| format!("opening store at {}", config.database_url))?;
        let transport = config.build_transport()?;
        Self::with_parts(config, store, transport).await
    }

    pub async fn with_parts(
        config: SyncConfig,
        store: Store,
        transport: Arc<dyn NotificationTransport>,
    ) -> Result<Self> {
        let registry = SourceRegistry::load(config.workspace_root.join("sources.yaml")).await?;
        let ingest = IngestPipeline::from_registry(store.clone(), &registry, &config.workspace_root);
        let alerts = OperatorAlerts::new(Arc::clone(&transport), config.admin_chat_id);
        let dispatcher = Dispatcher::new(store.clone(), transport, config.dispatcher_config());
        Ok(Self {
            config,
            ingest,
            dispatch: DispatchPipeline::new(store, dispatcher),
            alerts,
            cycle_lock: Mutex::new(()),
        })
    }

    pub fn ingest(&self) -> &IngestPipeline {
        &self.ingest
    }

    pub fn dispatch(&self) -> &DispatchPipeline {
        &self.dispatch
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let _cycle = self.cycle_lock.lock().await;
        self.run_cycle_locked().await
    }

    async fn run_cycle_locked(&self) -> Result<SyncRunSummary> {
        let started = Instant::now();
        let ingest = self.ingest.run_cycle().await;
        for report in ingest.sources.iter() {
            if let (Some(source), Some(error)) = (report.source, report.error.as_deref()) {
                self.alerts
                    .alert(&format!("source {source} failed: {error}"))
                    .await;
            }
        }

        let pass = match self.dispatch.run_pass().await {
            Ok(pass) => pass,
            Err(err) => {
                self.alerts
                    .alert(&format!("dispatch pass aborted, watermark not advanced: {err:#}"))
                    .await;
                return Err(err);
            }
        };
        if pass.failed > 0 {
            self.alerts
                .alert(&format!(
                    "{} of {} deliveries failed in pass {}",
                    pass.failed, pass.matched, pass.run_id
                ))
                .await;
        }

        let elapsed = started.elapsed();
        if elapsed > self.config.slow_cycle {
            warn!(
                elapsed_secs = elapsed.as_secs(),
                threshold_secs = self.config.slow_cycle.as_secs(),
                "sync cycle is slower than the threshold"
            );
            self.alerts
                .alert(&format!(
                    "sync cycle took {} ms, threshold is {} s",
                    elapsed.as_millis(),
                    self.config.slow_cycle.as_secs()
                ))
                .await;
        }
        Ok(SyncRunSummary {
            ingest,
            pass,
            elapsed_ms: elapsed.as_millis(),
        })
    }

    /// Scheduler tick: skips when the previous cycle is still running.
    async fn run_scheduled(&self) {
        let Ok(_cycle) = self.cycle_lock.try_lock() else {
            warn!("previous sync cycle still running; skipping this tick");
            return;
        };
        if let Err(err) = self.run_cycle_locked().await {
            error!(error = %format!("{err:#}"), "scheduled sync cycle failed");
        }
    }

    pub async fn build_scheduler(self: &Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                pipeline.run_scheduled().await;
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env()).await?;
    pipeline.run_once().await
}

/// Runs the cron schedule until Ctrl-C.
pub async fn run_scheduler_from_env() -> Result<()> {
    let config = SyncConfig::from_env();
    let cron = config.sync_cron.clone();
    let pipeline = Arc::new(SyncPipeline::new(config).await?);
    let mut sched = pipeline.build_scheduler().await?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use flatwatch_adapters::{AdapterError, TransportErrorKind};
    use flatwatch_core::{ListingDraft, Location, Notification, SubscriberFilter};
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, minute, 0).single().expect("ts")
    }

    struct ScriptedTransport {
        failures: StdMutex<Vec<TransportErrorKind>>,
        sent: StdMutex<Vec<(i64, Notification)>>,
    }

    impl ScriptedTransport {
        fn failing_with(kinds: Vec<TransportErrorKind>) -> Arc<Self> {
            Arc::new(Self {
                failures: StdMutex::new(kinds),
                sent: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl NotificationTransport for ScriptedTransport {
        async fn send(&self, recipient: i64, notification: &Notification) -> Result<(), TransportError> {
            let next = {
                let mut failures = self.failures.lock().expect("lock");
                if failures.is_empty() {
                    None
                } else {
                    Some(failures.remove(0))
                }
            };
            match next {
                Some(kind) => Err(TransportError::new(kind, "scripted")),
                None => {
                    self.sent.lock().expect("lock").push((recipient, notification.clone()));
                    Ok(())
                }
            }
        }
    }

    fn quick_config() -> DispatcherConfig {
        DispatcherConfig {
            send_delay: Duration::ZERO,
            sends_per_second: 1000,
            permanent_failure_limit: 2,
        }
    }

    fn berlin_draft(native_id: &str) -> ListingDraft {
        ListingDraft {
            id: ListingId::scoped(Source::Immowelt, native_id),
            source: Source::Immowelt,
            url: format!("https://www.immowelt.de/expose/{native_id}"),
            price: Some(1000.0),
            price_warm: None,
            size: Some(50.0),
            address: "Invalidenstr. 1, 10115 Berlin".into(),
            latitude: Some(52.53),
            longitude: Some(13.38),
            swap_flat: false,
            wbs_required: false,
            photo_urls: Vec::new(),
        }
    }

    async fn searching_subscriber(store: &Store, user_id: i64) {
        let (trial, _) = store.register_subscriber(user_id, ts(0, 0)).await.expect("register");
        store
            .upsert_subscriber(&SubscriberFilter {
                location: Location::circle(52.53, 13.38, 1000.0).expect("circle"),
                is_searching: true,
                ..trial
            })
            .await
            .expect("upsert");
    }

    #[test]
    fn registry_parses_workspace_sources_yaml() {
        let text = std::fs::read_to_string(
            Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sources.yaml"),
        )
        .expect("sources.yaml");
        let registry: SourceRegistry = serde_yaml::from_str(&text).expect("parse");
        let enabled = registry.enabled().map(|s| s.source).collect::<Vec<_>>();
        assert_eq!(enabled.len(), Source::ALL.len());
        assert!(enabled.contains(&Source::InBerlinWohnen));
    }

    #[test]
    fn fixture_path_defaults_to_source_slug() {
        let cfg = SourceConfig {
            source: Source::Kleinanzeigen,
            enabled: true,
            fixture: None,
            notes: None,
        };
        assert_eq!(
            cfg.fixture_path(Path::new("/ws")),
            PathBuf::from("/ws/fixtures/kleinanzeigen/listings.json")
        );
    }

    #[tokio::test]
    async fn dispatch_skips_pairs_already_in_ledger() {
        let dir = tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("db.sqlite")).await.expect("store");
        store.ingest_at(berlin_draft("a"), ts(10, 0)).await.expect("ingest");
        let listing = store
            .get_listing(&ListingId::scoped(Source::Immowelt, "a"))
            .await
            .expect("get")
            .expect("present");
        let pair = MatchPair::new(1, listing.id.clone());
        store.record_delivery(&pair, ts(10, 1)).await.expect("record");

        let transport = ScriptedTransport::failing_with(Vec::new());
        let dispatcher = Dispatcher::new(store, transport.clone(), quick_config());
        let outcome = dispatcher.dispatch(&pair, &listing).await.expect("dispatch");

        assert!(matches!(outcome, DispatchOutcome::Skipped(SkipReason::AlreadyRecorded)));
        assert!(transport.sent.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn permanent_failures_stop_search_after_limit() {
        let dir = tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("db.sqlite")).await.expect("store");
        searching_subscriber(&store, 9).await;
        store.ingest_at(berlin_draft("a"), ts(10, 0)).await.expect("ingest");
        store.ingest_at(berlin_draft("b"), ts(10, 0)).await.expect("ingest");

        let transport = ScriptedTransport::failing_with(vec![TransportErrorKind::Permanent; 2]);
        let pipeline = DispatchPipeline::new(
            store.clone(),
            Dispatcher::new(store.clone(), transport.clone(), quick_config()),
        );
        let summary = pipeline.run_pass_at(ts(10, 2)).await.expect("pass");

        assert_eq!(summary.matched, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(store.count_deliveries().await.expect("count"), 0);
        let subscriber = store.get_subscriber(9).await.expect("get").expect("kept");
        assert!(!subscriber.is_searching);
        assert_eq!(subscriber.permanent_failures, 2);
    }

    #[tokio::test]
    async fn success_resets_failure_counter() {
        let dir = tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("db.sqlite")).await.expect("store");
        searching_subscriber(&store, 4).await;
        store.record_permanent_failure(4, 3).await.expect("tally");
        store.ingest_at(berlin_draft("a"), ts(10, 0)).await.expect("ingest");

        let transport = ScriptedTransport::failing_with(Vec::new());
        let pipeline = DispatchPipeline::new(
            store.clone(),
            Dispatcher::new(store.clone(), transport.clone(), quick_config()),
        );
        let summary = pipeline.run_pass_at(ts(10, 2)).await.expect("pass");

        assert_eq!(summary.sent, 1);
        assert_eq!(store.get_subscriber(4).await.expect("get").expect("kept").permanent_failures, 0);
    }

    struct BrokenSource;

    #[async_trait]
    impl ListingSource for BrokenSource {
        fn source(&self) -> Source {
            Source::Kleinanzeigen
        }

        async fn fetch_listings(&self, _ctx: &AdapterContext) -> Result<Vec<ListingDraft>, AdapterError> {
            Err(AdapterError::Message("captcha wall".into()))
        }
    }

    struct StaticSource(Vec<ListingDraft>);

    #[async_trait]
    impl ListingSource for StaticSource {
        fn source(&self) -> Source {
            Source::Immowelt
        }

        async fn fetch_listings(&self, _ctx: &AdapterContext) -> Result<Vec<ListingDraft>, AdapterError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn failing_source_does_not_stop_the_cycle() {
        let dir = tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("db.sqlite")).await.expect("store");
        let mut blank = berlin_draft("x");
        blank.id = ListingId::scoped(Source::Immowelt, "");

        let pipeline = IngestPipeline::new(
            store.clone(),
            vec![
                Box::new(BrokenSource),
                Box::new(StaticSource(vec![berlin_draft("a"), berlin_draft("a"), blank])),
            ],
        );
        let summary = pipeline.run_cycle().await;

        assert_eq!(summary.failed_sources(), vec![Source::Kleinanzeigen]);
        let immowelt = &summary.sources[1];
        assert_eq!(immowelt.fetched, 3);
        assert_eq!(immowelt.inserted, 1);
        assert_eq!(immowelt.duplicates, 1);
        assert_eq!(immowelt.rejected, 1);
        assert_eq!(store.count_listings().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn alerts_reach_the_admin_chat_escaped() {
        let transport = ScriptedTransport::failing_with(Vec::new());
        let as_transport: Arc<dyn NotificationTransport> = transport.clone();

        OperatorAlerts::new(Arc::clone(&as_transport), None)
            .alert("nobody hears this")
            .await;
        assert!(transport.sent.lock().expect("lock").is_empty());

        OperatorAlerts::new(as_transport, Some(77))
            .alert("source <immowelt> failed")
            .await;
        let sent = transport.sent.lock().expect("lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 77);
        assert!(sent[0].1.text().contains("source &lt;immowelt&gt; failed"));
    }

    #[tokio::test]
    async fn undeliverable_alert_is_swallowed() {
        let transport = ScriptedTransport::failing_with(vec![TransportErrorKind::Permanent]);
        OperatorAlerts::new(transport.clone(), Some(77)).alert("anything").await;
        assert!(transport.sent.lock().expect("lock").is_empty());
    }
}
