use std::fs;
use std::io;
use std::path::PathBuf;

use parcel_atlas_shared::ParcelFilters;
use serde_json::Value;
use tracing::warn;

use crate::session::write_json;

const GUEST_KEY: &str = "pa_filters_guest";
const KEY_PREFIX: &str = "pa_filters_";

/// Saved filters per signed-in user, one JSON file each.
#[derive(Debug, Clone)]
pub struct FilterStore {
    dir: PathBuf,
}

pub fn key_for_user(sub: Option<&str>) -> String {
    match sub.filter(|s| !s.is_empty()) {
        Some(sub) => format!("{KEY_PREFIX}{sub}"),
        None => GUEST_KEY.to_string(),
    }
}

impl FilterStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, sub: Option<&str>) -> PathBuf {
        let key: String = key_for_user(sub)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{key}.json"))
    }

    /// Saved filters, or empty filters when nothing usable is stored.
    /// Non-numeric fields are dropped rather than rejecting the whole file.
    pub fn load(&self, sub: Option<&str>) -> ParcelFilters {
        let path = self.path_for(sub);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(error = %e, path = %path.display(), "failed to read saved filters");
                }
                return ParcelFilters::default();
            }
        };
        let Ok(raw) = serde_json::from_slice::<Value>(&bytes) else {
            warn!(path = %path.display(), "ignoring corrupt saved filters");
            return ParcelFilters::default();
        };
        let number = |name: &str| raw.get(name).and_then(Value::as_f64);
        ParcelFilters {
            min_value: number("minValue"),
            max_value: number("maxValue"),
            min_sqft: number("minSqft"),
            max_sqft: number("maxSqft"),
        }
    }

    pub fn save(&self, sub: Option<&str>, filters: &ParcelFilters) -> io::Result<()> {
        write_json(&self.path_for(sub), filters)
    }

    pub fn clear(&self, sub: Option<&str>) -> io::Result<()> {
        match fs::remove_file(self.path_for(sub)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
