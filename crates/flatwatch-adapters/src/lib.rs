//! Collaborator contracts: listing sources feeding the dedup gate and the
//! notification transports the dispatcher writes to.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flatwatch_core::{fits_caption, ListingDraft, ListingId, Notification, Source};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "flatwatch-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("bundle for `{found}` handed to the `{expected}` source")]
    SourceMismatch { expected: Source, found: Source },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A scraping collaborator reduced to "produce normalized drafts".
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source(&self) -> Source;

    async fn fetch_listings(&self, ctx: &AdapterContext) -> Result<Vec<ListingDraft>, AdapterError>;
}

/// Snapshot of one scrape, as captured from a source's result page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub source: Source,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub listings: Vec<FixtureListing>,
}

/// Listing as a scraper emits it, keyed by the source-native id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureListing {
    pub native_id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub price_warm: Option<f64>,
    #[serde(default)]
    pub size: Option<f64>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub swap_flat: bool,
    #[serde(default)]
    pub wbs_required: bool,
    #[serde(default)]
    pub photo_urls: Vec<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Scopes native ids to the bundle's source and drops records without one.
pub fn bundle_to_drafts(bundle: &FixtureBundle) -> Vec<ListingDraft> {
    bundle
        .listings
        .iter()
        .filter(|record| !record.native_id.trim().is_empty())
        .map(|record| ListingDraft {
            id: ListingId::scoped(bundle.source, &record.native_id),
            source: bundle.source,
            url: record.url.trim().to_string(),
            price: record.price,
            price_warm: record.price_warm,
            size: record.size,
            address: record.address.trim().to_string(),
            latitude: record.latitude,
            longitude: record.longitude,
            swap_flat: record.swap_flat,
            wbs_required: record.wbs_required,
            photo_urls: record
                .photo_urls
                .iter()
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty())
                .collect(),
        })
        .collect()
}

/// Replays a captured bundle from disk.
#[derive(Debug, Clone)]
pub struct FixtureListingSource {
    source: Source,
    bundle_path: PathBuf,
}

impl FixtureListingSource {
    pub fn new(source: Source, bundle_path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            bundle_path: bundle_path.into(),
        }
    }
}

#[async_trait]
impl ListingSource for FixtureListingSource {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch_listings(&self, ctx: &AdapterContext) -> Result<Vec<ListingDraft>, AdapterError> {
        let bundle = load_fixture_bundle(&self.bundle_path)?;
        if bundle.source != self.source {
            return Err(AdapterError::SourceMismatch {
                expected: self.source,
                found: bundle.source,
            });
        }
        let drafts = bundle_to_drafts(&bundle);
        info!(
            run_id = %ctx.run_id,
            source = %self.source,
            captured_at = %bundle.fetched_at,
            drafts = drafts.len(),
            "replayed fixture bundle"
        );
        Ok(drafts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    RateLimited,
    Transient,
    /// The recipient can never be reached this way (blocked the bot, chat gone).
    Permanent,
    /// The API refused this message's content; says nothing about the recipient.
    Rejected,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?} transport failure: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == TransportErrorKind::Permanent
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, TransportErrorKind::RateLimited | TransportErrorKind::Transient)
    }
}

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, recipient: i64, notification: &Notification) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: NotificationTransport + ?Sized> NotificationTransport for Arc<T> {
    async fn send(&self, recipient: i64, notification: &Notification) -> Result<(), TransportError> {
        (**self).send(recipient, notification).await
    }
}

/// Logs instead of sending; used when no bot token is configured.
#[derive(Debug, Clone, Default)]
pub struct DryRunTransport;

#[async_trait]
impl NotificationTransport for DryRunTransport {
    async fn send(&self, recipient: i64, notification: &Notification) -> Result<(), TransportError> {
        info!(
            recipient,
            photos = notification.photos().len(),
            chars = notification.text().chars().count(),
            "dry-run send"
        );
        Ok(())
    }
}

/// Bad Request descriptions that mean the chat itself is unreachable.
const UNREACHABLE_CHAT_MARKERS: [&str; 3] = ["chat not found", "user is deactivated", "peer_id_invalid"];

/// 401 and 404 count as transient: a bad token is our misconfiguration, not the
/// recipient's. Only 403 and an unreachable-chat 400 blame the recipient; any other
/// 4xx is a verdict on the message content.
pub fn classify_reply(status: StatusCode, description: &str) -> TransportErrorKind {
    let description = description.to_ascii_lowercase();
    match status {
        StatusCode::TOO_MANY_REQUESTS => TransportErrorKind::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND | StatusCode::REQUEST_TIMEOUT => {
            TransportErrorKind::Transient
        }
        StatusCode::FORBIDDEN => TransportErrorKind::Permanent,
        StatusCode::BAD_REQUEST
            if UNREACHABLE_CHAT_MARKERS
                .iter()
                .any(|marker| description.contains(marker)) =>
        {
            TransportErrorKind::Permanent
        }
        status if status.is_server_error() => TransportErrorKind::Transient,
        _ => TransportErrorKind::Rejected,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Continuous-refill token bucket shared by everything that sends.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_sec: if refill_per_sec > 0.0 { refill_per_sec } else { 1.0 },
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn per_second(rate: u32) -> Self {
        Self::new(rate, f64::from(rate.max(1)))
    }

    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub api_base: String,
    pub bot_token: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            api_base: "https://api.telegram.org".to_string(),
            bot_token: bot_token.into(),
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Telegram Bot API transport (`sendMessage` / `sendMediaGroup`, HTML parse mode).
#[derive(Debug, Clone)]
pub struct TelegramTransport {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    backoff: BackoffPolicy,
}

#[derive(Debug, Deserialize)]
struct TelegramReply {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<TelegramReplyParameters>,
}

#[derive(Debug, Deserialize)]
struct TelegramReplyParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

fn text_request(chat_id: i64, text: &str) -> (&'static str, JsonValue) {
    (
        "sendMessage",
        json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        }),
    )
}

/// The single Bot API call that delivers one notification. A photo group whose
/// caption cannot ride on the first photo is sent as its caption text alone.
pub fn telegram_request(chat_id: i64, notification: &Notification) -> (&'static str, JsonValue) {
    match notification {
        Notification::Text { body } => text_request(chat_id, body),
        Notification::PhotoGroup { caption, .. } if !fits_caption(caption) => text_request(chat_id, caption),
        Notification::PhotoGroup { caption, photos } => {
            let media = photos
                .iter()
                .enumerate()
                .map(|(index, url)| {
                    if index == 0 {
                        json!({ "type": "photo", "media": url, "caption": caption, "parse_mode": "HTML" })
                    } else {
                        json!({ "type": "photo", "media": url })
                    }
                })
                .collect::<Vec<_>>();
            ("sendMediaGroup", json!({ "chat_id": chat_id, "media": media }))
        }
    }
}

impl TelegramTransport {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token: config.bot_token,
            backoff: config.backoff,
        })
    }

    async fn call(&self, method: &str, body: &JsonValue) -> Result<(), TransportError> {
        let url = format!("{}/bot{}/{}", self.api_base, self.bot_token, method);
        let mut attempt = 0;

        loop {
            let failure = match self.client.post(&url).json(body).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    let status = resp.status();
                    let reply = resp.json::<TelegramReply>().await.ok();
                    let retry_after = reply
                        .as_ref()
                        .and_then(|r| r.parameters.as_ref())
                        .and_then(|p| p.retry_after)
                        .map(Duration::from_secs);
                    let description = reply
                        .and_then(|r| r.description)
                        .unwrap_or_else(|| status.to_string());
                    TransportError {
                        kind: classify_reply(status, &description),
                        message: format!("{method}: {description}"),
                        retry_after,
                    }
                }
                // The URL carries the token; keep it out of the message.
                Err(err) => TransportError::new(
                    TransportErrorKind::Transient,
                    format!("{method}: {}", err.without_url()),
                ),
            };

            if !failure.is_retryable() || attempt >= self.backoff.max_retries {
                return Err(failure);
            }
            let delay = failure
                .retry_after
                .unwrap_or_else(|| self.backoff.delay_for_attempt(attempt))
                .min(self.backoff.max_delay);
            warn!(attempt, ?delay, error = %failure, "retrying telegram call");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl NotificationTransport for TelegramTransport {
    async fn send(&self, recipient: i64, notification: &Notification) -> Result<(), TransportError> {
        let span = info_span!("telegram_send", recipient, photos = notification.photos().len());
        async {
            let (method, body) = telegram_request(recipient, notification);
            match (self.call(method, &body).await, notification) {
                // Usually a photo URL Telegram could not fetch; the text still goes out.
                (Err(err), Notification::PhotoGroup { caption, .. })
                    if method == "sendMediaGroup" && err.kind == TransportErrorKind::Rejected =>
                {
                    warn!(error = %err, "media group rejected, falling back to text");
                    let (method, body) = text_request(recipient, caption);
                    self.call(method, &body).await
                }
                (result, _) => result,
            }
        }
        .instrument(span)
        .await
    }
}
