//! SQLite persistence for flatwatch: listing store + dedup gate, subscriber
//! registry, delivery ledger, run watermark and pass log.
//!
//! Every mutation is a single statement: insert-if-absent or a single-row update.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use flatwatch_core::{
    ActiveState, DeliveryRecord, Listing, ListingDraft, ListingId, Location, MatchPair, Source,
    SubscriberFilter, MAX_PHOTOS,
};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "flatwatch-storage";

/// How far back the very first pass looks when no watermark has been written yet.
pub const INITIAL_BACKFILL_MINUTES: i64 = 5;

const WATERMARK_NAME: &str = "dispatch";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid listing: {0}")]
    InvalidListing(String),
    #[error("corrupt value in column `{column}`: {detail}")]
    Corrupt { column: &'static str, detail: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    Inserted,
    AlreadyPresent,
}

/// Watermark value together with the version it was read at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Watermark {
    pub at: DateTime<Utc>,
    /// `None` when no watermark row exists yet.
    pub version: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkAdvance {
    Advanced,
    /// Another pass moved the watermark after we read it; ours was not written.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub watermark: DateTime<Utc>,
    pub candidates: u64,
    pub subscribers: u64,
    pub matched: u64,
    pub sent: u64,
    pub skipped: u64,
    pub failed: u64,
    pub watermark_advanced: bool,
}

/// Result of counting a permanent delivery failure against a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureTally {
    pub consecutive: u32,
    pub searching_disabled: bool,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connects to a `sqlite://` URL and applies pending migrations.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::connect_with(options, StoreConfig::default()).await
    }

    /// Opens (creating if missing) a database file and applies pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| StoreError::Sqlx(sqlx::Error::Io(err)))?;
            }
        }
        let options = SqliteConnectOptions::new().filename(path);
        Self::connect_with(options, StoreConfig::default()).await
    }

    pub async fn connect_with(options: SqliteConnectOptions, config: StoreConfig) -> StoreResult<Self> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // Listing store + dedup gate

    pub async fn ingest(&self, draft: ListingDraft) -> StoreResult<IngestOutcome> {
        self.ingest_at(draft, Utc::now()).await
    }

    /// Insert-if-absent on the listing id. Racing callers see exactly one
    /// `Inserted`; the first-seen attributes win.
    pub async fn ingest_at(&self, mut draft: ListingDraft, created_at: DateTime<Utc>) -> StoreResult<IngestOutcome> {
        if draft.id.native_part().trim().is_empty() {
            return Err(StoreError::InvalidListing("listing id is empty".to_string()));
        }
        if draft.photo_urls.len() > MAX_PHOTOS {
            debug!(listing_id = %draft.id, photos = draft.photo_urls.len(), "truncating photo list");
            draft.photo_urls.truncate(MAX_PHOTOS);
        }
        let photo_urls = encode_json(&draft.photo_urls, "photo_urls")?;

        let result = sqlx::query(
            r#"
            INSERT INTO listings (
                id, source, url, price, price_warm, size, address, latitude, longitude,
                swap_flat, wbs_required, photo_urls, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(draft.id.as_str())
        .bind(draft.source.slug())
        .bind(&draft.url)
        .bind(draft.price)
        .bind(draft.price_warm)
        .bind(draft.size)
        .bind(&draft.address)
        .bind(draft.latitude)
        .bind(draft.longitude)
        .bind(draft.swap_flat)
        .bind(draft.wbs_required)
        .bind(photo_urls)
        .bind(encode_ts(created_at))
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            IngestOutcome::Inserted
        } else {
            IngestOutcome::AlreadyPresent
        })
    }

    pub async fn get_listing(&self, id: &ListingId) -> StoreResult<Option<Listing>> {
        let row = sqlx::query(&format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = ?1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    /// Candidate window for a pass: created at or after `since`, not known inactive.
    pub async fn listings_created_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Listing>> {
        let rows = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings
              WHERE created_at >= ?1
                AND (is_active IS NULL OR is_active != 0)
              ORDER BY created_at, id"
        ))
        .bind(encode_ts(since))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(listing_from_row).collect()
    }

    pub async fn count_listings(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM listings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Returns false when the listing does not exist.
    pub async fn set_active(&self, id: &ListingId, state: ActiveState, checked_at: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE listings SET is_active = ?2, last_checked = ?3 WHERE id = ?1")
            .bind(id.as_str())
            .bind(state.to_db())
            .bind(encode_ts(checked_at))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Deletes a listing confirmed gone. Ledger rows referring to it stay.
    pub async fn remove_listing(&self, id: &ListingId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM listings WHERE id = ?1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Id-ordered batch for a liveness checker working in rounds.
    pub async fn listings_for_liveness(
        &self,
        state: ActiveState,
        after: Option<&ListingId>,
        limit: u32,
    ) -> StoreResult<Vec<Listing>> {
        let state_clause = match state.to_db() {
            None => "is_active IS NULL".to_string(),
            Some(value) => format!("is_active = {value}"),
        };
        let rows = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings
              WHERE {state_clause} AND id > ?1
              ORDER BY id
              LIMIT ?2"
        ))
        .bind(after.map(ListingId::as_str).unwrap_or(""))
        .bind(i64::from(limit.max(1)))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(listing_from_row).collect()
    }

    // Subscriber filter registry

    /// Creates the trial record on first contact; an existing record is left alone.
    pub async fn register_subscriber(&self, user_id: i64, now: DateTime<Utc>) -> StoreResult<(SubscriberFilter, bool)> {
        let trial = SubscriberFilter::trial(user_id, now);
        let result = sqlx::query(
            r#"
            INSERT INTO subscribers (
                user_id, location, allow_swap_flat, allow_wbs_required, enabled_sources,
                subscription_until, is_searching, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            ON CONFLICT(user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(encode_location(&trial.location)?)
        .bind(trial.allow_swap_flat)
        .bind(trial.allow_wbs_required)
        .bind(encode_sources(&trial.enabled_sources)?)
        .bind(trial.subscription_until.map(encode_ts))
        .bind(trial.is_searching)
        .bind(encode_ts(now))
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() == 1;
        if created {
            info!(user_id, "registered subscriber with trial subscription");
        }
        let current = self.get_subscriber(user_id).await?.unwrap_or(trial);
        Ok((current, created))
    }

    /// Replaces the whole filter record keyed by `user_id`.
    pub async fn upsert_subscriber(&self, filter: &SubscriberFilter) -> StoreResult<()> {
        let now = encode_ts(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO subscribers (
                user_id, location, min_price, max_price, min_size, max_size,
                allow_swap_flat, allow_wbs_required, enabled_sources, subscription_until,
                is_searching, permanent_failures, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
            ON CONFLICT(user_id) DO UPDATE SET
                location = excluded.location,
                min_price = excluded.min_price,
                max_price = excluded.max_price,
                min_size = excluded.min_size,
                max_size = excluded.max_size,
                allow_swap_flat = excluded.allow_swap_flat,
                allow_wbs_required = excluded.allow_wbs_required,
                enabled_sources = excluded.enabled_sources,
                subscription_until = excluded.subscription_until,
                is_searching = excluded.is_searching,
                permanent_failures = excluded.permanent_failures,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(filter.user_id)
        .bind(encode_location(&filter.location)?)
        .bind(filter.min_price)
        .bind(filter.max_price)
        .bind(filter.min_size)
        .bind(filter.max_size)
        .bind(filter.allow_swap_flat)
        .bind(filter.allow_wbs_required)
        .bind(encode_sources(&filter.enabled_sources)?)
        .bind(filter.subscription_until.map(encode_ts))
        .bind(filter.is_searching)
        .bind(i64::from(filter.permanent_failures))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_subscriber(&self, user_id: i64) -> StoreResult<Option<SubscriberFilter>> {
        let row = sqlx::query(&format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE user_id = ?1"))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(subscriber_from_row).transpose()
    }

    pub async fn searching_subscribers(&self) -> StoreResult<Vec<SubscriberFilter>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE is_searching = 1 ORDER BY user_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(subscriber_from_row).collect()
    }

    pub async fn set_searching(&self, user_id: i64, searching: bool) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE subscribers SET is_searching = ?2, updated_at = ?3 WHERE user_id = ?1")
            .bind(user_id)
            .bind(searching)
            .bind(encode_ts(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Adds `days` to the later of the current expiry and `now`. Returns the new
    /// expiry, or `None` for an unknown subscriber.
    pub async fn extend_subscription(&self, user_id: i64, days: u32, now: DateTime<Utc>) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            r#"
            UPDATE subscribers
               SET subscription_until = strftime(
                       '%Y-%m-%dT%H:%M:%fZ',
                       CASE
                           WHEN subscription_until IS NULL OR subscription_until < ?2 THEN ?2
                           ELSE subscription_until
                       END,
                       ?3
                   ),
                   updated_at = ?2
             WHERE user_id = ?1
            RETURNING subscription_until
            "#,
        )
        .bind(user_id)
        .bind(encode_ts(now))
        .bind(format!("+{days} days"))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let until: String = row.try_get("subscription_until")?;
                Ok(Some(decode_ts(&until, "subscription_until")?))
            }
            None => Ok(None),
        }
    }

    /// Counts one more consecutive permanent failure; at `limit` the subscriber
    /// stops searching. The record itself is kept.
    pub async fn record_permanent_failure(&self, user_id: i64, limit: u32) -> StoreResult<Option<FailureTally>> {
        let row = sqlx::query(
            r#"
            UPDATE subscribers
               SET permanent_failures = permanent_failures + 1,
                   is_searching = CASE WHEN permanent_failures + 1 >= ?2 THEN 0 ELSE is_searching END,
                   updated_at = ?3
             WHERE user_id = ?1
            RETURNING permanent_failures, is_searching
            "#,
        )
        .bind(user_id)
        .bind(i64::from(limit.max(1)))
        .bind(encode_ts(Utc::now()))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let searching: bool = row.try_get("is_searching")?;
            Ok(FailureTally {
                consecutive: failure_counter_from_db(&row, "permanent_failures")?,
                searching_disabled: !searching,
            })
        })
        .transpose()
    }

    pub async fn reset_permanent_failures(&self, user_id: i64) -> StoreResult<()> {
        sqlx::query("UPDATE subscribers SET permanent_failures = 0 WHERE user_id = ?1 AND permanent_failures != 0")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Delivery ledger

    /// Ledger keys for every listing in the candidate window.
    pub async fn delivered_pairs_since(&self, since: DateTime<Utc>) -> StoreResult<HashSet<MatchPair>> {
        let rows = sqlx::query(
            r#"
            SELECT d.user_id, d.listing_id
              FROM deliveries d
              JOIN listings l ON l.id = d.listing_id
             WHERE l.created_at >= ?1
            "#,
        )
        .bind(encode_ts(since))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let user_id: i64 = row.try_get("user_id")?;
                let listing_id: String = row.try_get("listing_id")?;
                Ok(MatchPair::new(user_id, ListingId::from_raw(listing_id)))
            })
            .collect()
    }

    pub async fn is_delivered(&self, pair: &MatchPair) -> StoreResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM deliveries WHERE user_id = ?1 AND listing_id = ?2")
            .bind(pair.user_id)
            .bind(pair.listing_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Insert-if-absent on `(user_id, listing_id)`. Returns false when a row
    /// already existed, which is not an error.
    pub async fn record_delivery(&self, pair: &MatchPair, sent_at: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO deliveries (user_id, listing_id, sent_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, listing_id) DO NOTHING",
        )
        .bind(pair.user_id)
        .bind(pair.listing_id.as_str())
        .bind(encode_ts(sent_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn deliveries_for_user(&self, user_id: i64) -> StoreResult<Vec<DeliveryRecord>> {
        let rows = sqlx::query(
            "SELECT user_id, listing_id, sent_at FROM deliveries WHERE user_id = ?1 ORDER BY sent_at, listing_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let sent_at: String = row.try_get("sent_at")?;
                Ok(DeliveryRecord {
                    user_id: row.try_get("user_id")?,
                    listing_id: ListingId::from_raw(row.try_get::<String, _>("listing_id")?),
                    sent_at: decode_ts(&sent_at, "sent_at")?,
                })
            })
            .collect()
    }

    pub async fn count_deliveries(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deliveries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // Run watermark

    pub async fn read_watermark(&self, now: DateTime<Utc>) -> StoreResult<Watermark> {
        let row = sqlx::query("SELECT value, version FROM run_watermark WHERE name = ?1")
            .bind(WATERMARK_NAME)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let value: String = row.try_get("value")?;
                Ok(Watermark {
                    at: decode_ts(&value, "run_watermark.value")?,
                    version: Some(row.try_get("version")?),
                })
            }
            None => Ok(Watermark {
                at: now - ChronoDuration::minutes(INITIAL_BACKFILL_MINUTES),
                version: None,
            }),
        }
    }

    /// Compare-and-swap against the version in `read`. Callers pass the time
    /// their pass started (or earlier), never the time it finished.
    pub async fn advance_watermark(&self, read: &Watermark, pass_start: DateTime<Utc>) -> StoreResult<WatermarkAdvance> {
        let value = encode_ts(pass_start);
        let result = match read.version {
            None => {
                sqlx::query(
                    "INSERT INTO run_watermark (name, value, version) VALUES (?1, ?2, 1)
                     ON CONFLICT(name) DO NOTHING",
                )
                .bind(WATERMARK_NAME)
                .bind(value)
                .execute(&self.pool)
                .await?
            }
            Some(version) => {
                sqlx::query("UPDATE run_watermark SET value = ?2, version = version + 1 WHERE name = ?1 AND version = ?3")
                    .bind(WATERMARK_NAME)
                    .bind(value)
                    .bind(version)
                    .execute(&self.pool)
                    .await?
            }
        };

        Ok(if result.rows_affected() == 1 {
            WatermarkAdvance::Advanced
        } else {
            WatermarkAdvance::Superseded
        })
    }

    // Pass log

    pub async fn record_pass(&self, pass: &PassRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO passes (
                run_id, started_at, finished_at, watermark, candidates, subscribers,
                matched, sent, skipped, failed, watermark_advanced
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(pass.run_id.to_string())
        .bind(encode_ts(pass.started_at))
        .bind(encode_ts(pass.finished_at))
        .bind(encode_ts(pass.watermark))
        .bind(count_to_db(pass.candidates))
        .bind(count_to_db(pass.subscribers))
        .bind(count_to_db(pass.matched))
        .bind(count_to_db(pass.sent))
        .bind(count_to_db(pass.skipped))
        .bind(count_to_db(pass.failed))
        .bind(pass.watermark_advanced)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_pass(&self) -> StoreResult<Option<PassRecord>> {
        let row = sqlx::query(
            "SELECT run_id, started_at, finished_at, watermark, candidates, subscribers,
                    matched, sent, skipped, failed, watermark_advanced
               FROM passes
              ORDER BY started_at DESC
              LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(pass_from_row).transpose()
    }
}

const LISTING_COLUMNS: &str = "id, source, url, price, price_warm, size, address, latitude, longitude, \
     swap_flat, wbs_required, photo_urls, created_at, is_active, last_checked";

const SUBSCRIBER_COLUMNS: &str = "user_id, location, min_price, max_price, min_size, max_size, \
     allow_swap_flat, allow_wbs_required, enabled_sources, subscription_until, is_searching, permanent_failures";

/// Fixed-width UTC text, so lexical order in SQL equals chronological order.
pub fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn decode_ts(value: &str, column: &'static str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt {
            column,
            detail: format!("{value:?}: {err}"),
        })
}

fn encode_json<T: Serialize + ?Sized>(value: &T, column: &'static str) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|err| StoreError::Corrupt {
        column,
        detail: err.to_string(),
    })
}

fn encode_location(location: &Location) -> StoreResult<Option<String>> {
    match location {
        Location::Unset => Ok(None),
        other => encode_json(other, "location").map(Some),
    }
}

fn encode_sources(sources: &BTreeSet<Source>) -> StoreResult<String> {
    encode_json(sources, "enabled_sources")
}

fn count_to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn count_from_db(row: &SqliteRow, column: &'static str) -> StoreResult<u64> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value).map_err(|_| StoreError::Corrupt {
        column,
        detail: format!("negative count {value}"),
    })
}

fn failure_counter_from_db(row: &SqliteRow, column: &'static str) -> StoreResult<u32> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| StoreError::Corrupt {
        column,
        detail: format!("failure counter {value} out of range"),
    })
}

fn listing_from_row(row: &SqliteRow) -> StoreResult<Listing> {
    let source: String = row.try_get("source")?;
    let photo_urls: String = row.try_get("photo_urls")?;
    let created_at: String = row.try_get("created_at")?;
    let last_checked: Option<String> = row.try_get("last_checked")?;

    Ok(Listing {
        id: ListingId::from_raw(row.try_get::<String, _>("id")?),
        source: source.parse().map_err(|err: flatwatch_core::UnknownSource| StoreError::Corrupt {
            column: "source",
            detail: err.to_string(),
        })?,
        url: row.try_get("url")?,
        price: row.try_get("price")?,
        price_warm: row.try_get("price_warm")?,
        size: row.try_get("size")?,
        address: row.try_get("address")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        swap_flat: row.try_get("swap_flat")?,
        wbs_required: row.try_get("wbs_required")?,
        photo_urls: serde_json::from_str(&photo_urls).map_err(|err| StoreError::Corrupt {
            column: "photo_urls",
            detail: err.to_string(),
        })?,
        created_at: decode_ts(&created_at, "created_at")?,
        is_active: ActiveState::from_db(row.try_get("is_active")?),
        last_checked: last_checked
            .as_deref()
            .map(|value| decode_ts(value, "last_checked"))
            .transpose()?,
    })
}

fn subscriber_from_row(row: &SqliteRow) -> StoreResult<SubscriberFilter> {
    let location: Option<String> = row.try_get("location")?;
    let enabled_sources: String = row.try_get("enabled_sources")?;
    let subscription_until: Option<String> = row.try_get("subscription_until")?;

    Ok(SubscriberFilter {
        user_id: row.try_get("user_id")?,
        location: match location.as_deref() {
            None | Some("") => Location::Unset,
            Some(text) => serde_json::from_str(text).map_err(|err| StoreError::Corrupt {
                column: "location",
                detail: err.to_string(),
            })?,
        },
        min_price: row.try_get("min_price")?,
        max_price: row.try_get("max_price")?,
        min_size: row.try_get("min_size")?,
        max_size: row.try_get("max_size")?,
        allow_swap_flat: row.try_get("allow_swap_flat")?,
        allow_wbs_required: row.try_get("allow_wbs_required")?,
        enabled_sources: serde_json::from_str(&enabled_sources).map_err(|err| StoreError::Corrupt {
            column: "enabled_sources",
            detail: err.to_string(),
        })?,
        subscription_until: subscription_until
            .as_deref()
            .map(|value| decode_ts(value, "subscription_until"))
            .transpose()?,
        is_searching: row.try_get("is_searching")?,
        permanent_failures: failure_counter_from_db(row, "permanent_failures")?,
    })
}

fn pass_from_row(row: &SqliteRow) -> StoreResult<PassRecord> {
    let run_id: String = row.try_get("run_id")?;
    let started_at: String = row.try_get("started_at")?;
    let finished_at: String = row.try_get("finished_at")?;
    let watermark: String = row.try_get("watermark")?;

    Ok(PassRecord {
        run_id: Uuid::parse_str(&run_id).map_err(|err| StoreError::Corrupt {
            column: "run_id",
            detail: err.to_string(),
        })?,
        started_at: decode_ts(&started_at, "started_at")?,
        finished_at: decode_ts(&finished_at, "finished_at")?,
        watermark: decode_ts(&watermark, "watermark")?,
        candidates: count_from_db(row, "candidates")?,
        subscribers: count_from_db(row, "subscribers")?,
        matched: count_from_db(row, "matched")?,
        sent: count_from_db(row, "sent")?,
        skipped: count_from_db(row, "skipped")?,
        failed: count_from_db(row, "failed")?,
        watermark_advanced: row.try_get("watermark_advanced")?,
    })
}
