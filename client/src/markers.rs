use std::collections::HashMap;

use parcel_atlas_shared::format::{escape_html, format_money_full, format_number, marker_label};
use parcel_atlas_shared::{FeatureSummary, Parcel};
use tracing::debug;

use crate::viewport::{MapSurface, MarkerId, MarkerSpec, PopupId, PopupSpec};

/// `(zoom upper bound, cap)` bands; at or above the last bound the cap is
/// `MAX_MARKERS`.
const MARKER_BANDS: [(f64, usize); 3] = [(11.0, 120), (13.0, 250), (15.0, 600)];
pub const MAX_MARKERS: usize = 1200;
const NO_ADDRESS: &str = "(no address)";

/// Number of markers allowed on screen at `zoom`. Non-decreasing in zoom.
pub fn marker_cap(zoom: f64) -> usize {
    MARKER_BANDS
        .iter()
        .find(|(below, _)| zoom < *below)
        .map(|(_, cap)| *cap)
        .unwrap_or(MAX_MARKERS)
}

/// Parcels that get a marker: usable coordinates, in server order, up to the
/// cap for `zoom`.
pub fn declutter(items: &[Parcel], zoom: f64) -> impl Iterator<Item = &Parcel> {
    items
        .iter()
        .filter(|p| p.has_finite_coords())
        .take(marker_cap(zoom))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PopupKey {
    Parcel(String),
    Feature(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PopupState {
    #[default]
    Closed,
    Open { key: PopupKey, id: PopupId },
}

/// Owns every marker and the single popup on the map.
#[derive(Debug, Default)]
pub struct MarkerRenderer {
    mounted: Vec<(String, MarkerId)>,
    rendered: HashMap<String, Parcel>,
    popup: PopupState,
}

impl MarkerRenderer {
    pub fn mounted_count(&self) -> usize {
        self.mounted.len()
    }

    pub fn mounted_keys(&self) -> impl Iterator<Item = &str> {
        self.mounted.iter().map(|(key, _)| key.as_str())
    }

    pub fn popup(&self) -> &PopupState {
        &self.popup
    }

    pub fn open_key(&self) -> Option<&PopupKey> {
        match &self.popup {
            PopupState::Open { key, .. } => Some(key),
            PopupState::Closed => None,
        }
    }

    /// Full teardown and rebuild for `items` at `zoom`. A marker popup whose
    /// parcel is no longer rendered is closed with it.
    pub fn render<S: MapSurface>(&mut self, surface: &mut S, items: &[Parcel], zoom: f64) {
        self.remove_markers(surface);

        for parcel in declutter(items, zoom) {
            let id = surface.add_marker(marker_spec(parcel));
            self.mounted.push((parcel.sl_uuid.clone(), id));
            self.rendered.insert(parcel.sl_uuid.clone(), parcel.clone());
        }

        if let Some(PopupKey::Parcel(key)) = self.open_key() {
            if !self.rendered.contains_key(key) {
                self.close(surface);
            }
        }
        debug!(
            rendered = self.mounted.len(),
            candidates = items.len(),
            cap = marker_cap(zoom),
            "markers rebuilt"
        );
    }

    /// Toggles the popup for a marker: same key closes, another key replaces.
    pub fn click_marker<S: MapSurface>(&mut self, surface: &mut S, key: &str) {
        let already_open = matches!(self.open_key(), Some(PopupKey::Parcel(open)) if open == key);
        self.close(surface);
        if already_open {
            return;
        }
        let Some(parcel) = self.rendered.get(key) else {
            return;
        };
        let spec = PopupSpec {
            lng: parcel.lng,
            lat: parcel.lat,
            html: parcel_popup_html(parcel),
        };
        self.open(surface, PopupKey::Parcel(key.to_string()), spec);
    }

    /// Opens a popup at the click point from polygon feature properties.
    pub fn click_feature<S: MapSurface>(
        &mut self,
        surface: &mut S,
        lng: f64,
        lat: f64,
        summary: &FeatureSummary,
    ) {
        self.close(surface);
        let key = summary
            .key
            .clone()
            .unwrap_or_else(|| format!("{lng},{lat}"));
        let spec = PopupSpec {
            lng,
            lat,
            html: feature_popup_html(summary),
        };
        self.open(surface, PopupKey::Feature(key), spec);
    }

    pub fn click_empty<S: MapSurface>(&mut self, surface: &mut S) {
        self.close(surface);
    }

    /// The widget already removed the popup; only forget it.
    pub fn popup_closed(&mut self, id: PopupId) {
        if matches!(&self.popup, PopupState::Open { id: open, .. } if *open == id) {
            self.popup = PopupState::Closed;
        }
    }

    /// Closes the popup if it belongs to a polygon feature.
    pub fn close_feature_popup<S: MapSurface>(&mut self, surface: &mut S) {
        if matches!(self.open_key(), Some(PopupKey::Feature(_))) {
            self.close(surface);
        }
    }

    pub fn close<S: MapSurface>(&mut self, surface: &mut S) {
        if let PopupState::Open { id, .. } = std::mem::take(&mut self.popup) {
            surface.remove_popup(id);
        }
    }

    pub fn clear<S: MapSurface>(&mut self, surface: &mut S) {
        self.close(surface);
        self.remove_markers(surface);
    }

    fn open<S: MapSurface>(&mut self, surface: &mut S, key: PopupKey, spec: PopupSpec) {
        // Single popup: anything still open goes first.
        self.close(surface);
        let id = surface.add_popup(spec);
        self.popup = PopupState::Open { key, id };
    }

    fn remove_markers<S: MapSurface>(&mut self, surface: &mut S) {
        for (_, id) in self.mounted.drain(..) {
            surface.remove_marker(id);
        }
        self.rendered.clear();
    }
}

fn marker_spec(parcel: &Parcel) -> MarkerSpec {
    let label = marker_label(parcel.total_value);
    MarkerSpec {
        key: parcel.sl_uuid.clone(),
        lng: parcel.lng,
        lat: parcel.lat,
        html: format!(r#"<div class="parcel-pill">{}</div>"#, escape_html(&label)),
        label,
    }
}

pub fn parcel_popup_html(parcel: &Parcel) -> String {
    popup_html(
        parcel.address.as_deref().filter(|a| !a.trim().is_empty()),
        Some(parcel.county.as_str()),
        parcel.total_value,
        parcel.sqft,
    )
}

pub fn feature_popup_html(summary: &FeatureSummary) -> String {
    popup_html(
        summary.address.as_deref(),
        summary.county.as_deref(),
        summary.total_value,
        summary.sqft,
    )
}

fn popup_html(
    address: Option<&str>,
    county: Option<&str>,
    total_value: Option<f64>,
    sqft: Option<f64>,
) -> String {
    format!(
        concat!(
            r#"<div class="parcel-popup">"#,
            r#"<div class="parcel-popup__title">{}</div>"#,
            r#"<div><b>County:</b> {}</div>"#,
            r#"<div><b>Total Value:</b> {}</div>"#,
            r#"<div><b>Sqft:</b> {}</div>"#,
            "</div>"
        ),
        escape_html(address.unwrap_or(NO_ADDRESS)),
        escape_html(county.unwrap_or_default()),
        format_money_full(total_value),
        format_number(sqft),
    )
}
