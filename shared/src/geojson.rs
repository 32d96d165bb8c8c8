use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::parcel::Parcel;

const FEATURE_COLLECTION: &str = "FeatureCollection";
const FEATURE: &str = "Feature";

/// Minimal GeoJSON FeatureCollection. Geometry is kept opaque; only the map
/// surface interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type", default = "feature_collection_type")]
    pub kind: String,
    #[serde(default)]
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type", default = "feature_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default)]
    pub geometry: Option<Value>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

fn feature_collection_type() -> String {
    FEATURE_COLLECTION.to_string()
}

fn feature_type() -> String {
    FEATURE.to_string()
}

impl Default for FeatureCollection {
    fn default() -> Self {
        Self {
            kind: feature_collection_type(),
            features: Vec::new(),
        }
    }
}

impl FeatureCollection {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Point features for every parcel with usable coordinates.
pub fn centroids_to_feature_collection(items: &[Parcel]) -> FeatureCollection {
    let features = items
        .iter()
        .filter(|p| p.has_finite_coords())
        .map(|p| {
            let mut properties = Map::new();
            properties.insert("sl_uuid".into(), json!(p.sl_uuid));
            properties.insert(
                "address".into(),
                json!(p.address.as_deref().unwrap_or_default()),
            );
            properties.insert("county".into(), json!(p.county));
            properties.insert("sqft".into(), json!(p.sqft));
            properties.insert("total_value".into(), json!(p.total_value));
            Feature {
                kind: feature_type(),
                id: None,
                geometry: Some(json!({
                    "type": "Point",
                    "coordinates": [p.lng, p.lat],
                })),
                properties,
            }
        })
        .collect();

    FeatureCollection {
        kind: feature_collection_type(),
        features,
    }
}

/// The popup-relevant attributes of a polygon feature.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureSummary {
    pub key: Option<String>,
    pub address: Option<String>,
    pub county: Option<String>,
    pub total_value: Option<f64>,
    pub sqft: Option<f64>,
}

impl FeatureSummary {
    pub fn from_feature(feature: &Feature) -> Self {
        let props = &feature.properties;
        let key = string_prop(props, "sl_uuid").or_else(|| match &feature.id {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        });
        Self {
            key,
            address: string_prop(props, "address"),
            county: string_prop(props, "county"),
            total_value: number_prop(props, "total_value"),
            sqft: number_prop(props, "sqft"),
        }
    }
}

fn string_prop(props: &Map<String, Value>, name: &str) -> Option<String> {
    props
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// Map widgets hand feature properties back as strings as often as numbers.
fn number_prop(props: &Map<String, Value>, name: &str) -> Option<f64> {
    let value = match props.get(name)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.filter(|v| v.is_finite())
}
