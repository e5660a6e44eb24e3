//! Core domain model, geometry and matching for flatwatch.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "flatwatch-core";

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Upper bound on photos carried by a listing and by one grouped message.
pub const MAX_PHOTOS: usize = 10;

/// Telegram rejects media captions longer than this many characters.
pub const CAPTION_LIMIT: usize = 1024;

/// Length of the trial subscription handed to a newly registered subscriber.
pub const TRIAL_DAYS: i64 = 7;

/// Origin of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Source {
    #[serde(rename = "immoscout24")]
    ImmobilienScout24,
    #[serde(rename = "kleinanzeigen")]
    Kleinanzeigen,
    #[serde(rename = "immowelt")]
    Immowelt,
    #[serde(rename = "inberlinwohnen")]
    InBerlinWohnen,
}

impl Source {
    pub const ALL: [Source; 4] = [
        Source::ImmobilienScout24,
        Source::Kleinanzeigen,
        Source::Immowelt,
        Source::InBerlinWohnen,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            Source::ImmobilienScout24 => "immoscout24",
            Source::Kleinanzeigen => "kleinanzeigen",
            Source::Immowelt => "immowelt",
            Source::InBerlinWohnen => "inberlinwohnen",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Source::ImmobilienScout24 => "ImmobilienScout24",
            Source::Kleinanzeigen => "Kleinanzeigen",
            Source::Immowelt => "Immowelt",
            Source::InBerlinWohnen => "InBerlinWohnen",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown listing source `{0}`")]
pub struct UnknownSource(pub String);

impl FromStr for Source {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Source::ALL
            .into_iter()
            .find(|source| source.slug().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownSource(s.to_string()))
    }
}

/// Globally unique listing identifier, namespaced by source: `"{slug}:{native_id}"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(String);

impl ListingId {
    pub fn scoped(source: Source, native_id: &str) -> Self {
        Self(format!("{}:{}", source.slug(), native_id.trim()))
    }

    /// Wraps an already-scoped identifier, e.g. one read back from storage.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part after the source prefix; empty when the source-native id was blank.
    pub fn native_part(&self) -> &str {
        self.0.split_once(':').map(|(_, native)| native).unwrap_or(&self.0)
    }
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Liveness of a listing as last reported by the liveness checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveState {
    #[default]
    Unknown,
    Active,
    Inactive,
}

impl ActiveState {
    pub fn to_db(self) -> Option<i64> {
        match self {
            ActiveState::Unknown => None,
            ActiveState::Active => Some(1),
            ActiveState::Inactive => Some(0),
        }
    }

    pub fn from_db(value: Option<i64>) -> Self {
        match value {
            None => ActiveState::Unknown,
            Some(0) => ActiveState::Inactive,
            Some(_) => ActiveState::Active,
        }
    }
}

/// Normalized handoff record from a scraping collaborator into the dedup gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub id: ListingId,
    pub source: Source,
    #[serde(default)]
    pub url: String,
    pub price: Option<f64>,
    #[serde(default)]
    pub price_warm: Option<f64>,
    pub size: Option<f64>,
    #[serde(default)]
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub swap_flat: bool,
    #[serde(default)]
    pub wbs_required: bool,
    #[serde(default)]
    pub photo_urls: Vec<String>,
}

/// Persisted listing. `created_at` is the ingestion time assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub source: Source,
    pub url: String,
    pub price: Option<f64>,
    pub price_warm: Option<f64>,
    pub size: Option<f64>,
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub swap_flat: bool,
    pub wbs_required: bool,
    pub photo_urls: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub is_active: ActiveState,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Listing {
    pub fn from_draft(draft: ListingDraft, created_at: DateTime<Utc>) -> Self {
        Self {
            id: draft.id,
            source: draft.source,
            url: draft.url,
            price: draft.price,
            price_warm: draft.price_warm,
            size: draft.size,
            address: draft.address,
            latitude: draft.latitude,
            longitude: draft.longitude,
            swap_flat: draft.swap_flat,
            wbs_required: draft.wbs_required,
            photo_urls: draft.photo_urls,
            created_at,
            is_active: ActiveState::Unknown,
            last_checked: None,
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }

    /// True when every attribute the matching engine filters on is present.
    pub fn is_complete(&self) -> bool {
        self.price.is_some() && self.size.is_some() && self.coordinates().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocationError {
    #[error("circle radius must be a positive number of metres, got {0}")]
    InvalidRadius(f64),
    #[error("coordinates out of range: ({lat}, {lon})")]
    InvalidCoordinate { lat: f64, lon: f64 },
    #[error("polygon needs at least 3 vertices, got {0}")]
    TooFewVertices(usize),
}

/// Geographic area a subscriber is interested in.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Location {
    Circle {
        center_lat: f64,
        center_lon: f64,
        radius_m: f64,
    },
    /// Vertices as `(lat, lon)` pairs in drawing order; the ring closes implicitly.
    Polygon { vertices: Vec<(f64, f64)> },
    #[default]
    Unset,
}

fn check_coordinate(lat: f64, lon: f64) -> Result<(), LocationError> {
    if lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) {
        Ok(())
    } else {
        Err(LocationError::InvalidCoordinate { lat, lon })
    }
}

impl Location {
    pub fn circle(center_lat: f64, center_lon: f64, radius_m: f64) -> Result<Self, LocationError> {
        check_coordinate(center_lat, center_lon)?;
        if !(radius_m.is_finite() && radius_m > 0.0) {
            return Err(LocationError::InvalidRadius(radius_m));
        }
        Ok(Location::Circle {
            center_lat,
            center_lon,
            radius_m,
        })
    }

    pub fn polygon(vertices: Vec<(f64, f64)>) -> Result<Self, LocationError> {
        if vertices.len() < 3 {
            return Err(LocationError::TooFewVertices(vertices.len()));
        }
        for &(lat, lon) in &vertices {
            check_coordinate(lat, lon)?;
        }
        Ok(Location::Polygon { vertices })
    }

    /// Records can reach us without going through the constructors (stored rows,
    /// API payloads), so matchability is re-checked at match time.
    pub fn is_matchable(&self) -> bool {
        match self {
            Location::Circle {
                center_lat,
                center_lon,
                radius_m,
            } => check_coordinate(*center_lat, *center_lon).is_ok() && radius_m.is_finite() && *radius_m > 0.0,
            Location::Polygon { vertices } => {
                vertices.len() >= 3 && vertices.iter().all(|&(lat, lon)| lat.is_finite() && lon.is_finite())
            }
            Location::Unset => false,
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        match self {
            Location::Circle {
                center_lat,
                center_lon,
                radius_m,
            } => haversine_distance_m(*center_lat, *center_lon, lat, lon) <= *radius_m,
            Location::Polygon { vertices } => point_in_polygon(lat, lon, vertices),
            Location::Unset => false,
        }
    }
}

/// Great-circle distance in metres.
pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Ray casting along increasing longitude. Each edge is half-open in latitude
/// (lower end included, upper end excluded), so a ray passing exactly through a
/// vertex is counted once.
pub fn point_in_polygon(lat: f64, lon: f64, vertices: &[(f64, f64)]) -> bool {
    if vertices.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = vertices.len() - 1;
    for (i, &(lat_i, lon_i)) in vertices.iter().enumerate() {
        let (lat_j, lon_j) = vertices[j];
        if (lat_i > lat) != (lat_j > lat) {
            let crossing_lon = lon_i + (lat - lat_i) * (lon_j - lon_i) / (lat_j - lat_i);
            if lon < crossing_lon {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Per-subscriber matching criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberFilter {
    pub user_id: i64,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub min_size: Option<f64>,
    #[serde(default)]
    pub max_size: Option<f64>,
    #[serde(default)]
    pub allow_swap_flat: bool,
    #[serde(default)]
    pub allow_wbs_required: bool,
    #[serde(default)]
    pub enabled_sources: BTreeSet<Source>,
    #[serde(default)]
    pub subscription_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_searching: bool,
    #[serde(default)]
    pub permanent_failures: u32,
}

impl SubscriberFilter {
    /// Record created on first contact: trial window, every source, no area yet.
    pub fn trial(user_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            location: Location::Unset,
            min_price: None,
            max_price: None,
            min_size: None,
            max_size: None,
            allow_swap_flat: false,
            allow_wbs_required: false,
            enabled_sources: Source::ALL.into_iter().collect(),
            subscription_until: Some(now + Duration::days(TRIAL_DAYS)),
            is_searching: false,
            permanent_failures: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.subscription_until.is_some_and(|until| until < now)
    }

    pub fn eligibility(&self, now: DateTime<Utc>) -> Eligibility {
        if self.is_expired(now) {
            Eligibility::Expired
        } else if !self.is_searching {
            Eligibility::NotSearching
        } else if !self.location.is_matchable() {
            Eligibility::NoLocation
        } else if self.enabled_sources.is_empty() {
            Eligibility::NoSources
        } else {
            Eligibility::Eligible
        }
    }

    /// Attribute and geographic checks for one listing; subscriber-level
    /// eligibility is not re-checked here.
    pub fn evaluate(&self, listing: &Listing) -> Result<(), Rejection> {
        let (Some(price), Some(size), Some((lat, lon))) = (listing.price, listing.size, listing.coordinates()) else {
            return Err(Rejection::Incomplete);
        };
        if !self.enabled_sources.contains(&listing.source) {
            return Err(Rejection::SourceDisabled);
        }
        if listing.swap_flat && !self.allow_swap_flat {
            return Err(Rejection::SwapFlat);
        }
        if listing.wbs_required && !self.allow_wbs_required {
            return Err(Rejection::WbsRequired);
        }
        if !within_bounds(price, self.min_price, self.max_price) {
            return Err(Rejection::PriceOutOfRange);
        }
        if !within_bounds(size, self.min_size, self.max_size) {
            return Err(Rejection::SizeOutOfRange);
        }
        if !self.location.contains(lat, lon) {
            return Err(Rejection::OutsideArea);
        }
        Ok(())
    }
}

fn within_bounds(value: f64, min: Option<f64>, max: Option<f64>) -> bool {
    min.map_or(true, |min| value >= min) && max.map_or(true, |max| value <= max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Expired,
    NotSearching,
    NoLocation,
    NoSources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Incomplete,
    SourceDisabled,
    SwapFlat,
    WbsRequired,
    PriceOutOfRange,
    SizeOutOfRange,
    OutsideArea,
}

/// Ledger key: one notification per subscriber and listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchPair {
    pub user_id: i64,
    pub listing_id: ListingId,
}

impl MatchPair {
    pub fn new(user_id: i64, listing_id: ListingId) -> Self {
        Self { user_id, listing_id }
    }
}

/// Ledger row; its existence is what "already notified" means.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub user_id: i64,
    pub listing_id: ListingId,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchReport {
    pub pairs: Vec<MatchPair>,
    /// Subscribers whose `subscription_until` has passed; the caller persists
    /// `is_searching = false` for them.
    pub expired_subscribers: Vec<i64>,
    pub incomplete_listings: Vec<ListingId>,
}

/// Computes every (subscriber, listing) pair that should be notified.
///
/// Pairs already present in `delivered` are never emitted. Output order carries
/// no meaning.
pub fn match_candidates(
    candidates: &[Listing],
    subscribers: &[SubscriberFilter],
    delivered: &HashSet<MatchPair>,
    now: DateTime<Utc>,
) -> MatchReport {
    let mut report = MatchReport::default();

    let (complete, incomplete): (Vec<&Listing>, Vec<&Listing>) =
        candidates.iter().partition(|listing| listing.is_complete());
    for listing in incomplete {
        debug!(listing_id = %listing.id, "listing lacks price, size or coordinates; excluded from matching");
        report.incomplete_listings.push(listing.id.clone());
    }

    for subscriber in subscribers {
        match subscriber.eligibility(now) {
            Eligibility::Eligible => {}
            Eligibility::Expired => {
                report.expired_subscribers.push(subscriber.user_id);
                continue;
            }
            Eligibility::NotSearching | Eligibility::NoLocation | Eligibility::NoSources => continue,
        }

        for listing in &complete {
            let pair = MatchPair::new(subscriber.user_id, listing.id.clone());
            if delivered.contains(&pair) {
                continue;
            }
            if subscriber.evaluate(listing).is_ok() {
                report.pairs.push(pair);
            }
        }
    }

    report
}

/// Outbound message for one listing; the transport picks the API call by variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Text { body: String },
    /// Up to [`MAX_PHOTOS`] photos sent as one group; the caption rides on the first.
    PhotoGroup { caption: String, photos: Vec<String> },
}

impl Notification {
    pub fn text(&self) -> &str {
        match self {
            Notification::Text { body } => body,
            Notification::PhotoGroup { caption, .. } => caption,
        }
    }

    pub fn photos(&self) -> &[String] {
        match self {
            Notification::Text { .. } => &[],
            Notification::PhotoGroup { photos, .. } => photos,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddressLine {
    Full,
    LinkOnly,
}

fn message_body(listing: &Listing, address: AddressLine) -> String {
    let address_text = match address {
        AddressLine::Full => escape_html(&listing.address),
        AddressLine::LinkOnly => "Google Maps".to_string(),
    };
    format!(
        "🏠 <b>New Flat for You!</b>\n{}\n📏 <b>Size:</b> {} m²\n🔗 <a href='{}'>{} Link</a>\n📍 <a href='{}'>{}</a>",
        price_line(listing.price, listing.price_warm),
        listing.size.map(format_amount).unwrap_or_else(|| "n/a".to_string()),
        href_safe(&listing.url),
        listing.source.display_name(),
        maps_link(&listing.address),
        address_text,
    )
}

/// Every variant goes out as a single API call. A caption over [`CAPTION_LIMIT`]
/// first loses the address text, then the photos.
pub fn compose_notification(listing: &Listing) -> Notification {
    let body = message_body(listing, AddressLine::Full);

    let photos = listing
        .photo_urls
        .iter()
        .map(|url| url.trim())
        .filter(|url| !url.is_empty())
        .take(MAX_PHOTOS)
        .map(str::to_string)
        .collect::<Vec<_>>();

    if photos.is_empty() {
        return Notification::Text { body };
    }
    if fits_caption(&body) {
        return Notification::PhotoGroup { caption: body, photos };
    }
    let short = message_body(listing, AddressLine::LinkOnly);
    if fits_caption(&short) {
        return Notification::PhotoGroup { caption: short, photos };
    }
    Notification::Text { body }
}

pub fn fits_caption(caption: &str) -> bool {
    caption.chars().count() <= CAPTION_LIMIT
}

/// Warm rent is shown only when it is strictly above the cold rent.
pub fn price_line(price: Option<f64>, price_warm: Option<f64>) -> String {
    let Some(price) = price else {
        return "💰 <b>Price:</b> n/a".to_string();
    };
    match price_warm {
        Some(warm) if warm > price => format!(
            "💰 <b>Kaltmiete:</b> {} € | <b>Warmmiete:</b> {} €",
            format_amount(price),
            format_amount(warm)
        ),
        _ => format!("💰 <b>Price:</b> {} €", format_amount(price)),
    }
}

pub fn maps_link(address: &str) -> String {
    format!(
        "https://www.google.com/maps/search/?api=1&query={}",
        urlencoding::encode(address.trim())
    )
}

/// Whole numbers print without a fractional part.
pub fn format_amount(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn href_safe(url: &str) -> String {
    url.trim().replace('\'', "%27").replace(' ', "%20")
}
