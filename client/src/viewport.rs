//! The map widget as seen by the coordinator and renderer: bounds and zoom,
//! settle/click events, and imperative marker, popup and layer management.

use std::collections::{BTreeMap, HashMap};

use parcel_atlas_shared::{BoundingBox, Feature, FeatureCollection};

use crate::markers::MarkerRenderer;
use crate::polygon::PolygonLayer;

pub type MarkerId = u64;
pub type PopupId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerSpec {
    pub key: String,
    pub lng: f64,
    pub lat: f64,
    pub label: String,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PopupSpec {
    pub lng: f64,
    pub lat: f64,
    pub html: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Fill,
    Line,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerSpec {
    pub id: String,
    pub source: String,
    pub kind: LayerKind,
    /// Clicks on interactive layers arrive as `MapClick::Feature`.
    pub interactive: bool,
}

/// What the user clicked on.
#[derive(Debug, Clone, PartialEq)]
pub enum MapClick {
    Marker {
        key: String,
    },
    Feature {
        layer: String,
        lng: f64,
        lat: f64,
        feature: Feature,
    },
    Empty {
        lng: f64,
        lat: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewportEvent {
    Load,
    MoveEnd,
    ZoomEnd,
    Click(MapClick),
    /// The popup's own close button was used.
    PopupClosed(PopupId),
}

/// Map widget capability. Implementations only draw; all policy lives in the
/// coordinator and renderer.
pub trait MapSurface {
    fn bounds(&self) -> BoundingBox;
    fn zoom(&self) -> f64;

    fn add_marker(&mut self, marker: MarkerSpec) -> MarkerId;
    fn remove_marker(&mut self, id: MarkerId);

    fn add_popup(&mut self, popup: PopupSpec) -> PopupId;
    fn remove_popup(&mut self, id: PopupId);

    fn has_source(&self, id: &str) -> bool;
    fn add_source(&mut self, id: &str, data: &FeatureCollection);
    fn set_source_data(&mut self, id: &str, data: &FeatureCollection);
    fn remove_source(&mut self, id: &str);
    fn add_layer(&mut self, layer: LayerSpec);
    fn remove_layer(&mut self, id: &str);

    fn set_loading(&mut self, loading: bool);
    fn set_status(&mut self, text: &str);
}

/// Exclusive owner of a mounted map surface together with everything the
/// renderer put on it. Dropping or releasing the handle removes markers, the
/// popup and the polygon layer.
pub struct ViewportHandle<S: MapSurface> {
    surface: S,
    pub(crate) markers: MarkerRenderer,
    pub(crate) polygons: PolygonLayer,
    released: bool,
}

impl<S: MapSurface> ViewportHandle<S> {
    pub fn mount(surface: S) -> Self {
        Self {
            surface,
            markers: MarkerRenderer::default(),
            polygons: PolygonLayer::default(),
            released: false,
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn markers(&self) -> &MarkerRenderer {
        &self.markers
    }

    pub fn polygons(&self) -> &PolygonLayer {
        &self.polygons
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Split borrow for renderer calls that mutate the surface.
    pub(crate) fn parts(&mut self) -> (&mut S, &mut MarkerRenderer, &mut PolygonLayer) {
        (&mut self.surface, &mut self.markers, &mut self.polygons)
    }

    /// Tears down everything this handle mounted. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.markers.clear(&mut self.surface);
        self.polygons.teardown(&mut self.surface);
        self.surface.set_loading(false);
    }
}

impl<S: MapSurface> Drop for ViewportHandle<S> {
    fn drop(&mut self) {
        self.release();
    }
}

/// In-memory map surface. Used by the CLI and by tests to observe exactly
/// what would be on screen.
#[derive(Debug, Clone)]
pub struct HeadlessMap {
    bounds: BoundingBox,
    zoom: f64,
    next_id: u64,
    pub markers: BTreeMap<MarkerId, MarkerSpec>,
    pub popups: BTreeMap<PopupId, PopupSpec>,
    pub sources: HashMap<String, FeatureCollection>,
    pub layers: Vec<LayerSpec>,
    pub loading: bool,
    pub status: String,
    pub source_adds: usize,
    pub source_updates: usize,
}

impl HeadlessMap {
    pub fn new(bounds: BoundingBox, zoom: f64) -> Self {
        Self {
            bounds,
            zoom,
            next_id: 0,
            markers: BTreeMap::new(),
            popups: BTreeMap::new(),
            sources: HashMap::new(),
            layers: Vec::new(),
            loading: false,
            status: String::new(),
            source_adds: 0,
            source_updates: 0,
        }
    }

    /// Moves the camera. The caller emits the matching settle event.
    pub fn set_view(&mut self, bounds: BoundingBox, zoom: f64) {
        self.bounds = bounds;
        self.zoom = zoom;
    }

    pub fn marker_by_key(&self, key: &str) -> Option<(MarkerId, &MarkerSpec)> {
        self.markers
            .iter()
            .find(|(_, m)| m.key == key)
            .map(|(id, m)| (*id, m))
    }

    pub fn open_popup(&self) -> Option<(PopupId, &PopupSpec)> {
        self.popups.iter().next().map(|(id, p)| (*id, p))
    }

    pub fn has_layer(&self, id: &str) -> bool {
        self.layers.iter().any(|l| l.id == id)
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl MapSurface for HeadlessMap {
    fn bounds(&self) -> BoundingBox {
        self.bounds
    }

    fn zoom(&self) -> f64 {
        self.zoom
    }

    fn add_marker(&mut self, marker: MarkerSpec) -> MarkerId {
        let id = self.allocate_id();
        self.markers.insert(id, marker);
        id
    }

    fn remove_marker(&mut self, id: MarkerId) {
        self.markers.remove(&id);
    }

    fn add_popup(&mut self, popup: PopupSpec) -> PopupId {
        let id = self.allocate_id();
        self.popups.insert(id, popup);
        id
    }

    fn remove_popup(&mut self, id: PopupId) {
        self.popups.remove(&id);
    }

    fn has_source(&self, id: &str) -> bool {
        self.sources.contains_key(id)
    }

    fn add_source(&mut self, id: &str, data: &FeatureCollection) {
        self.source_adds += 1;
        self.sources.insert(id.to_string(), data.clone());
    }

    fn set_source_data(&mut self, id: &str, data: &FeatureCollection) {
        if let Some(existing) = self.sources.get_mut(id) {
            self.source_updates += 1;
            *existing = data.clone();
        }
    }

    fn remove_source(&mut self, id: &str) {
        self.sources.remove(id);
    }

    fn add_layer(&mut self, layer: LayerSpec) {
        if !self.has_layer(&layer.id) {
            self.layers.push(layer);
        }
    }

    fn remove_layer(&mut self, id: &str) {
        self.layers.retain(|l| l.id != id);
    }

    fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }

    fn set_status(&mut self, text: &str) {
        self.status = text.to_string();
    }
}
