use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use flatwatch_adapters::{NotificationTransport, TransportError, TransportErrorKind};
use flatwatch_core::{maps_link, ListingDraft, ListingId, Location, Notification, Source, SubscriberFilter};
use flatwatch_storage::{Store, WatermarkAdvance};
use flatwatch_sync::{DispatchPipeline, Dispatcher, DispatcherConfig, SyncConfig, SyncPipeline};
use tempfile::{tempdir, TempDir};

const ADDRESS: &str = "Rosenthaler Str. 40, 10178 Berlin";

#[derive(Default)]
struct RecordingTransport {
    scripted_failures: Mutex<HashMap<i64, Vec<TransportErrorKind>>>,
    sent: Mutex<Vec<(i64, Notification)>>,
}

impl RecordingTransport {
    fn fail_next(&self, recipient: i64, kind: TransportErrorKind) {
        self.scripted_failures
            .lock()
            .expect("lock")
            .entry(recipient)
            .or_default()
            .push(kind);
    }

    fn sent_to(&self, recipient: i64) -> Vec<Notification> {
        self.sent
            .lock()
            .expect("lock")
            .iter()
            .filter(|(r, _)| *r == recipient)
            .map(|(_, n)| n.clone())
            .collect()
    }

    fn total_sent(&self) -> usize {
        self.sent.lock().expect("lock").len()
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn send(&self, recipient: i64, notification: &Notification) -> Result<(), TransportError> {
        let scripted = self
            .scripted_failures
            .lock()
            .expect("lock")
            .get_mut(&recipient)
            .and_then(|queue| (!queue.is_empty()).then(|| queue.remove(0)));
        if let Some(kind) = scripted {
            return Err(TransportError::new(kind, "scripted failure"));
        }
        self.sent.lock().expect("lock").push((recipient, notification.clone()));
        Ok(())
    }
}

fn ts(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, hour, minute, second)
        .single()
        .expect("ts")
}

fn quick() -> DispatcherConfig {
    DispatcherConfig {
        send_delay: Duration::ZERO,
        sends_per_second: 1000,
        permanent_failure_limit: 3,
    }
}

fn scout_listing(native_id: &str) -> ListingDraft {
    ListingDraft {
        id: ListingId::scoped(Source::ImmobilienScout24, native_id),
        source: Source::ImmobilienScout24,
        url: format!("https://www.immobilienscout24.de/expose/{native_id}"),
        price: Some(1200.0),
        price_warm: None,
        size: Some(45.0),
        address: ADDRESS.to_string(),
        latitude: Some(52.521),
        longitude: Some(13.406),
        swap_flat: false,
        wbs_required: false,
        photo_urls: Vec::new(),
    }
}

async fn open_store() -> (TempDir, Store) {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(dir.path().join("flatwatch.db")).await.expect("store");
    (dir, store)
}

/// Circle (52.52, 13.405) r = 2 km, price <= 1500, size >= 40, ImmobilienScout24 only.
async fn add_subscriber(store: &Store, user_id: i64, registered_at: DateTime<Utc>) -> SubscriberFilter {
    let (trial, _) = store.register_subscriber(user_id, registered_at).await.expect("register");
    let filter = SubscriberFilter {
        location: Location::circle(52.52, 13.405, 2000.0).expect("circle"),
        max_price: Some(1500.0),
        min_size: Some(40.0),
        enabled_sources: [Source::ImmobilienScout24].into_iter().collect(),
        is_searching: true,
        ..trial
    };
    store.upsert_subscriber(&filter).await.expect("upsert");
    filter
}

fn pipeline(store: &Store, transport: &Arc<RecordingTransport>) -> DispatchPipeline {
    let transport: Arc<dyn NotificationTransport> = transport.clone();
    DispatchPipeline::new(store.clone(), Dispatcher::new(store.clone(), transport, quick()))
}

#[tokio::test]
async fn end_to_end_match_sends_one_text_message_and_one_ledger_row() {
    let (_dir, store) = open_store().await;
    let transport = Arc::new(RecordingTransport::default());
    add_subscriber(&store, 100, ts(9, 0, 0)).await;

    store.ingest_at(scout_listing("158204417"), ts(10, 0, 0)).await.expect("ingest");
    let mut other_source = scout_listing("2987760023");
    other_source.id = ListingId::scoped(Source::Kleinanzeigen, "2987760023");
    other_source.source = Source::Kleinanzeigen;
    store.ingest_at(other_source, ts(10, 0, 0)).await.expect("ingest");

    let summary = pipeline(&store, &transport).run_pass_at(ts(10, 1, 0)).await.expect("pass");

    assert_eq!(summary.matched, 1);
    assert_eq!(summary.sent, 1);
    assert_eq!(summary.watermark_advance, WatermarkAdvance::Advanced);
    assert_eq!(store.count_deliveries().await.expect("count"), 1);

    let sent = transport.sent_to(100);
    assert_eq!(sent.len(), 1);
    let Notification::Text { body } = &sent[0] else {
        panic!("expected a text-only message, got {:?}", sent[0]);
    };
    assert!(body.contains("1200"));
    assert!(body.contains(&maps_link(ADDRESS)));
    assert!(body.contains("ImmobilienScout24"));

    let latest = store.latest_pass().await.expect("latest").expect("recorded");
    assert_eq!(latest.run_id, summary.run_id);
    assert_eq!(latest.sent, 1);
}

#[tokio::test]
async fn transient_failure_is_retried_by_the_next_pass_without_duplicates() {
    let (_dir, store) = open_store().await;
    let transport = Arc::new(RecordingTransport::default());
    add_subscriber(&store, 1, ts(9, 0, 0)).await;
    add_subscriber(&store, 2, ts(9, 0, 0)).await;
    store.ingest_at(scout_listing("L1"), ts(10, 0, 0)).await.expect("ingest");
    transport.fail_next(2, TransportErrorKind::Transient);

    let pipeline = pipeline(&store, &transport);
    let first = pipeline.run_pass_at(ts(10, 1, 0)).await.expect("first pass");
    assert_eq!((first.sent, first.failed), (1, 1));
    assert_eq!(first.advanced_to, ts(10, 0, 0));
    assert_eq!(store.count_deliveries().await.expect("count"), 1);

    let second = pipeline.run_pass_at(ts(10, 2, 0)).await.expect("second pass");
    assert_eq!((second.sent, second.failed), (1, 0));
    assert_eq!(second.advanced_to, ts(10, 2, 0));

    let third = pipeline.run_pass_at(ts(10, 3, 0)).await.expect("third pass");
    assert_eq!(third.candidates, 0);

    assert_eq!(transport.sent_to(1).len(), 1);
    assert_eq!(transport.sent_to(2).len(), 1);
    assert_eq!(store.count_deliveries().await.expect("count"), 2);
    assert_eq!(store.get_subscriber(2).await.expect("get").expect("kept").permanent_failures, 0);
}

#[tokio::test]
async fn concurrent_passes_write_at_most_one_ledger_row_per_pair() {
    let (_dir, store) = open_store().await;
    let transport = Arc::new(RecordingTransport::default());
    add_subscriber(&store, 7, ts(9, 0, 0)).await;
    store.ingest_at(scout_listing("race"), ts(10, 0, 0)).await.expect("ingest");

    let a = pipeline(&store, &transport);
    let b = pipeline(&store, &transport);
    let (left, right) = tokio::join!(a.run_pass_at(ts(10, 1, 0)), b.run_pass_at(ts(10, 1, 0)));
    let (left, right) = (left.expect("left"), right.expect("right"));

    assert_eq!(store.count_deliveries().await.expect("count"), 1);
    assert!(
        left.watermark_advance == WatermarkAdvance::Advanced || right.watermark_advance == WatermarkAdvance::Advanced
    );
    assert!(transport.total_sent() >= 1);
}

#[tokio::test]
async fn listing_created_mid_pass_is_seen_by_the_next_pass() {
    let (_dir, store) = open_store().await;
    let transport = Arc::new(RecordingTransport::default());
    add_subscriber(&store, 5, ts(9, 0, 0)).await;
    let pipeline = pipeline(&store, &transport);

    let t0 = ts(10, 0, 0);
    let first = pipeline.run_pass_at(t0).await.expect("first pass");
    assert_eq!(first.candidates, 0);

    // Ingested while the first pass was running, after it loaded candidates.
    store.ingest_at(scout_listing("late"), ts(10, 0, 1)).await.expect("ingest");

    let second = pipeline.run_pass_at(ts(10, 5, 0)).await.expect("second pass");
    assert_eq!(second.watermark, t0);
    assert_eq!(second.sent, 1);
    assert_eq!(transport.sent_to(5).len(), 1);
}

#[tokio::test]
async fn expired_subscription_gets_nothing_and_stops_searching() {
    let (_dir, store) = open_store().await;
    let transport = Arc::new(RecordingTransport::default());
    let mut filter = add_subscriber(&store, 8, ts(9, 0, 0)).await;
    filter.subscription_until = Some(ts(9, 30, 0));
    store.upsert_subscriber(&filter).await.expect("upsert");
    store.ingest_at(scout_listing("L1"), ts(10, 0, 0)).await.expect("ingest");

    let summary = pipeline(&store, &transport).run_pass_at(ts(10, 1, 0)).await.expect("pass");

    assert_eq!(summary.expired_subscribers, vec![8]);
    assert_eq!(summary.matched, 0);
    assert_eq!(transport.total_sent(), 0);
    assert!(!store.get_subscriber(8).await.expect("get").expect("kept").is_searching);
}

#[tokio::test]
async fn rejected_content_never_counts_against_the_recipient() {
    let (_dir, store) = open_store().await;
    let transport = Arc::new(RecordingTransport::default());
    add_subscriber(&store, 3, ts(9, 0, 0)).await;
    for native_id in ["R1", "R2", "R3"] {
        store.ingest_at(scout_listing(native_id), ts(10, 0, 0)).await.expect("ingest");
        transport.fail_next(3, TransportErrorKind::Rejected);
    }

    let summary = pipeline(&store, &transport).run_pass_at(ts(10, 1, 0)).await.expect("pass");

    assert_eq!((summary.sent, summary.failed), (0, 3));
    assert_eq!(summary.advanced_to, ts(10, 1, 0));
    let subscriber = store.get_subscriber(3).await.expect("get").expect("kept");
    assert_eq!(subscriber.permanent_failures, 0);
    assert!(subscriber.is_searching);
}

fn fixture_config(db_dir: &Path) -> SyncConfig {
    SyncConfig {
        database_url: format!("sqlite://{}", db_dir.join("sync.db").display()),
        workspace_root: Path::new(env!("CARGO_MANIFEST_DIR")).join("../.."),
        telegram_bot_token: None,
        telegram_api_base: "http://127.0.0.1:9".to_string(),
        http_timeout_secs: 1,
        send_delay: Duration::ZERO,
        sends_per_second: 1000,
        permanent_failure_limit: 3,
        scheduler_enabled: false,
        sync_cron: "0 * * * * *".to_string(),
        slow_cycle: Duration::from_secs(180),
        admin_chat_id: None,
    }
}

#[tokio::test]
async fn sync_cycle_over_workspace_fixtures_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    let config = fixture_config(dir.path());
    let store = Store::connect(&config.database_url).await.expect("store");
    let transport = Arc::new(RecordingTransport::default());
    let (trial, _) = store.register_subscriber(42, Utc::now()).await.expect("register");
    store
        .upsert_subscriber(&SubscriberFilter {
            location: Location::circle(52.52, 13.405, 2000.0).expect("circle"),
            max_price: Some(1500.0),
            is_searching: true,
            ..trial
        })
        .await
        .expect("upsert");

    let as_transport: Arc<dyn NotificationTransport> = transport.clone();
    let sync = SyncPipeline::with_parts(config, store.clone(), as_transport)
        .await
        .expect("pipeline");

    let first = sync.run_once().await.expect("first cycle");
    assert!(first.ingest.failed_sources().is_empty());
    assert_eq!(first.ingest.inserted(), 8);
    assert_eq!(first.pass.incomplete_listings, 1);
    assert_eq!(first.pass.sent, 1);

    let sent = transport.sent_to(42);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].photos().len(), 2);
    assert!(sent[0].text().contains("Warmmiete"));

    let second = sync.run_once().await.expect("second cycle");
    assert_eq!(second.ingest.inserted(), 0);
    assert_eq!(second.pass.sent, 0);
    assert_eq!(transport.total_sent(), 1);
    assert_eq!(store.count_listings().await.expect("count"), 8);
}

#[tokio::test]
async fn operator_is_alerted_about_failed_sources_and_slow_cycles() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("sources.yaml"),
        "sources:\n  - source: immowelt\n    enabled: true\n    fixture: fixtures/immowelt/missing.json\n",
    )
    .expect("write sources.yaml");
    let config = SyncConfig {
        workspace_root: dir.path().to_path_buf(),
        slow_cycle: Duration::ZERO,
        admin_chat_id: Some(9000),
        ..fixture_config(dir.path())
    };
    let store = Store::connect(&config.database_url).await.expect("store");
    let transport = Arc::new(RecordingTransport::default());
    let as_transport: Arc<dyn NotificationTransport> = transport.clone();
    let sync = SyncPipeline::with_parts(config, store, as_transport)
        .await
        .expect("pipeline");

    let summary = sync.run_once().await.expect("cycle survives a failing source");
    assert_eq!(summary.ingest.failed_sources(), vec![Source::Immowelt]);

    let alerts = transport.sent_to(9000);
    assert_eq!(alerts.len(), 2);
    assert!(alerts[0].text().contains("source immowelt failed"));
    assert!(alerts[1].text().contains("threshold"));
    assert_eq!(transport.total_sent(), 2);
}
