use parcel_atlas_shared::FeatureCollection;
use tracing::debug;

use crate::config::{DEFAULT_POLYGON_MAX_COUNT, DEFAULT_POLYGON_MIN_COUNT, DEFAULT_POLYGON_MIN_ZOOM};
use crate::viewport::{LayerKind, LayerSpec, MapSurface};

pub const SOURCE_ID: &str = "parcels-poly-src";
pub const FILL_LAYER_ID: &str = "parcels-poly-fill";
pub const OUTLINE_LAYER_ID: &str = "parcels-poly-outline";

/// When parcel outlines are worth fetching: zoomed in far enough and with a
/// result set small enough to draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolygonPolicy {
    pub min_zoom: f64,
    pub min_count: u64,
    pub max_count: u64,
}

impl Default for PolygonPolicy {
    fn default() -> Self {
        Self {
            min_zoom: DEFAULT_POLYGON_MIN_ZOOM,
            min_count: DEFAULT_POLYGON_MIN_COUNT,
            max_count: DEFAULT_POLYGON_MAX_COUNT,
        }
    }
}

impl PolygonPolicy {
    /// `count` is the centroid result's matched total.
    pub fn is_eligible(&self, zoom: f64, count: u64) -> bool {
        zoom >= self.min_zoom && (self.min_count..=self.max_count).contains(&count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolygonMount {
    Added,
    Updated,
}

/// The fixed-identity polygon source and its fill/outline layers.
#[derive(Debug, Default)]
pub struct PolygonLayer {
    mounted: bool,
    features: usize,
}

impl PolygonLayer {
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn feature_count(&self) -> usize {
        self.features
    }

    /// Adds the layer if absent, otherwise swaps its data in place.
    pub fn upsert<S: MapSurface>(&mut self, surface: &mut S, data: &FeatureCollection) -> PolygonMount {
        self.features = data.len();
        if self.mounted && surface.has_source(SOURCE_ID) {
            surface.set_source_data(SOURCE_ID, data);
            debug!(features = data.len(), "polygon layer updated");
            return PolygonMount::Updated;
        }

        if surface.has_source(SOURCE_ID) {
            surface.set_source_data(SOURCE_ID, data);
        } else {
            surface.add_source(SOURCE_ID, data);
        }
        surface.add_layer(LayerSpec {
            id: FILL_LAYER_ID.to_string(),
            source: SOURCE_ID.to_string(),
            kind: LayerKind::Fill,
            interactive: true,
        });
        surface.add_layer(LayerSpec {
            id: OUTLINE_LAYER_ID.to_string(),
            source: SOURCE_ID.to_string(),
            kind: LayerKind::Line,
            interactive: false,
        });
        self.mounted = true;
        debug!(features = data.len(), "polygon layer mounted");
        PolygonMount::Added
    }

    /// Removes layers before the source they draw from. Returns whether
    /// anything was mounted.
    pub fn teardown<S: MapSurface>(&mut self, surface: &mut S) -> bool {
        let was_mounted = self.mounted || surface.has_source(SOURCE_ID);
        if !was_mounted {
            return false;
        }
        surface.remove_layer(OUTLINE_LAYER_ID);
        surface.remove_layer(FILL_LAYER_ID);
        surface.remove_source(SOURCE_ID);
        self.mounted = false;
        self.features = 0;
        debug!("polygon layer removed");
        true
    }
}
