use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::geojson::FeatureCollection;

/// A parcel in its centroid representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parcel {
    pub sl_uuid: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub county: String,
    #[serde(default)]
    pub sqft: Option<f64>,
    #[serde(default)]
    pub total_value: Option<f64>,
    #[serde(default = "missing_coord", deserialize_with = "nullable_coord")]
    pub lat: f64,
    #[serde(default = "missing_coord", deserialize_with = "nullable_coord")]
    pub lng: f64,
}

impl Parcel {
    pub fn has_finite_coords(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }
}

// Rows without a geocode come back as `null` or without the key; keep the
// record and let the renderer drop it instead of failing the whole page.
fn missing_coord() -> f64 {
    f64::NAN
}

fn nullable_coord<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchFormat {
    #[default]
    Centroid,
    Polygon,
}

impl FetchFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Centroid => "centroid",
            Self::Polygon => "polygon",
        }
    }
}

impl fmt::Display for FetchFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Echo of the parameters the server actually applied.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AppliedParams {
    #[serde(default)]
    pub format: FetchFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentroidResponse {
    pub count: u64,
    #[serde(default)]
    pub items: Vec<Parcel>,
    #[serde(default)]
    pub applied: AppliedParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolygonResponse {
    pub count: u64,
    #[serde(default)]
    pub geojson: Option<FeatureCollection>,
    #[serde(default)]
    pub applied: AppliedParams,
}

impl PolygonResponse {
    /// Geometry to mount, if the server sent any features.
    pub fn features(&self) -> Option<&FeatureCollection> {
        self.geojson.as_ref().filter(|fc| !fc.features.is_empty())
    }
}

/// Typed result of one parcel fetch, tagged by the requested representation.
#[derive(Debug, Clone, PartialEq)]
pub enum ParcelPage {
    Centroids(CentroidResponse),
    Polygons(PolygonResponse),
}

impl ParcelPage {
    pub fn format(&self) -> FetchFormat {
        match self {
            Self::Centroids(_) => FetchFormat::Centroid,
            Self::Polygons(_) => FetchFormat::Polygon,
        }
    }
}
