use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parcel_atlas_shared::{BoundingBox, ParcelFilters};
use tracing::info;

use crate::api::{FetchError, ParcelClient};
use crate::config::EXPORT_FILENAME;

pub fn export_query(
    bbox: &BoundingBox,
    filters: &ParcelFilters,
    limit: u32,
) -> Vec<(&'static str, String)> {
    let mut pairs = vec![
        ("bbox", bbox.to_query_value()),
        ("limit", limit.to_string()),
    ];
    pairs.extend(filters.query_pairs());
    pairs
}

/// Fetches the CSV for the given view. Unauthenticated exports are sent as-is;
/// the server decides what a guest may download.
pub async fn download_csv(
    client: &ParcelClient,
    bbox: &BoundingBox,
    filters: &ParcelFilters,
    limit: u32,
) -> Result<Bytes, FetchError> {
    let bytes = client
        .get_authorized("/parcels/export.csv", &export_query(bbox, filters, limit))
        .await?;
    info!(bytes = bytes.len(), %bbox, "export downloaded");
    Ok(bytes)
}

/// Writes the export as `parcels_export.csv` under `dir`.
pub fn save_export(dir: &Path, csv: &[u8]) -> io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(EXPORT_FILENAME);
    std::fs::write(&path, csv)?;
    Ok(path)
}
