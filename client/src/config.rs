use std::path::PathBuf;
use std::time::Duration;

use crate::polygon::PolygonPolicy;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_MOVE_DEBOUNCE_MS: u64 = 350;
pub const DEFAULT_CENTROID_LIMIT: u32 = 1500;
pub const DEFAULT_POLYGON_LIMIT: u32 = 200;
pub const DEFAULT_EXPORT_LIMIT: u32 = 5000;
pub const DEFAULT_POLYGON_MIN_ZOOM: f64 = 14.0;
pub const DEFAULT_POLYGON_MIN_COUNT: u64 = 1;
pub const DEFAULT_POLYGON_MAX_COUNT: u64 = 100;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_STATE_DIR: &str = ".parcel-atlas";
pub const EXPORT_FILENAME: &str = "parcels_export.csv";
pub const TOKEN_EXPIRY_BUFFER_SECS: i64 = 30;

// Initial camera zoom for `view`.
pub const INITIAL_ZOOM: f64 = 10.0;

pub fn api_base_url() -> String {
    std::env::var("PARCEL_API_BASE_URL")
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
}

pub fn move_debounce() -> Duration {
    std::env::var("PARCEL_MOVE_DEBOUNCE_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(DEFAULT_MOVE_DEBOUNCE_MS))
}

pub fn centroid_limit() -> u32 {
    positive_u32("PARCEL_CENTROID_LIMIT", DEFAULT_CENTROID_LIMIT)
}

pub fn polygon_limit() -> u32 {
    positive_u32("PARCEL_POLYGON_LIMIT", DEFAULT_POLYGON_LIMIT)
}

pub fn export_limit() -> u32 {
    positive_u32("PARCEL_EXPORT_LIMIT", DEFAULT_EXPORT_LIMIT)
}

pub fn polygon_min_zoom() -> f64 {
    std::env::var("PARCEL_POLYGON_MIN_ZOOM")
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value >= 0.0)
        .unwrap_or(DEFAULT_POLYGON_MIN_ZOOM)
}

pub fn polygon_count_range() -> (u64, u64) {
    let min = std::env::var("PARCEL_POLYGON_MIN_COUNT")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_POLYGON_MIN_COUNT);
    let max = std::env::var("PARCEL_POLYGON_MAX_COUNT")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_POLYGON_MAX_COUNT);
    if min > max {
        (DEFAULT_POLYGON_MIN_COUNT, DEFAULT_POLYGON_MAX_COUNT)
    } else {
        (min, max)
    }
}

pub fn http_timeout() -> Duration {
    positive_secs("PARCEL_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)
}

pub fn http_connect_timeout() -> Duration {
    positive_secs(
        "PARCEL_HTTP_CONNECT_TIMEOUT_SECS",
        DEFAULT_HTTP_CONNECT_TIMEOUT_SECS,
    )
}

pub fn state_dir() -> PathBuf {
    std::env::var("PARCEL_STATE_DIR")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
}

fn positive_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn positive_secs(name: &str, default: u64) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default))
}

/// Identity provider settings. All four must be present to log in; the
/// logout URI is optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcConfig {
    pub domain: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub logout_uri: Option<String>,
}

impl OidcConfig {
    pub fn from_env() -> Option<Self> {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Some(Self {
            domain: read("OIDC_DOMAIN")?.trim_end_matches('/').to_string(),
            client_id: read("OIDC_CLIENT_ID")?,
            redirect_uri: read("OIDC_REDIRECT_URI")?,
            logout_uri: read("OIDC_LOGOUT_URI"),
        })
    }
}

/// Knobs the request coordinator needs for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    pub move_debounce: Duration,
    pub centroid_limit: u32,
    pub polygon_limit: u32,
    pub polygon: PolygonPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            move_debounce: Duration::from_millis(DEFAULT_MOVE_DEBOUNCE_MS),
            centroid_limit: DEFAULT_CENTROID_LIMIT,
            polygon_limit: DEFAULT_POLYGON_LIMIT,
            polygon: PolygonPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        let (min_count, max_count) = polygon_count_range();
        Self {
            move_debounce: move_debounce(),
            centroid_limit: centroid_limit(),
            polygon_limit: polygon_limit(),
            polygon: PolygonPolicy {
                min_zoom: polygon_min_zoom(),
                min_count,
                max_count,
            },
        }
    }
}
