//! Viewport-driven synchronization: decides when to fetch, what to fetch, and
//! whether a response may still touch the map.
//!
//! Runs on a single thread (`tokio::task::LocalSet`). Every cycle takes a
//! generation number when it starts and re-checks it, together with the
//! liveness flag, after each await. Superseded requests still complete; their
//! results are dropped.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use parcel_atlas_shared::geojson::centroids_to_feature_collection;
use parcel_atlas_shared::{
    BoundingBox, FeatureCollection, FeatureSummary, FetchFormat, FilterValidationError, Parcel,
    ParcelFilters, ParcelPage,
};
use tokio::sync::watch;
use tokio::task::{JoinHandle, spawn_local};
use tracing::{debug, warn};

use crate::api::{FetchError, FetchRequest, ParcelSource};
use crate::config::CoordinatorConfig;
use crate::polygon::{FILL_LAYER_ID, PolygonMount};
use crate::session::Tokens;
use crate::viewport::{MapClick, MapSurface, ViewportEvent, ViewportHandle};

pub const LOADING_TEXT: &str = "Loading parcels...";

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Centroids were applied to the map.
    Applied {
        generation: u64,
        rendered: usize,
        count: u64,
        polygons: PolygonOutcome,
    },
    /// Superseded or torn down before the centroid result landed.
    Stale { generation: u64 },
    Failed {
        generation: u64,
        error: FetchError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolygonOutcome {
    Ineligible,
    Mounted(PolygonMount),
    /// The polygon response had no geometry, or eligibility lapsed meanwhile.
    Cleared,
    Stale,
    Failed(FetchError),
}

struct CoordinatorState<S: MapSurface> {
    handle: ViewportHandle<S>,
    filters: ParcelFilters,
    items: Vec<Parcel>,
    count: u64,
}

struct Inner<S: MapSurface, C: ParcelSource> {
    config: CoordinatorConfig,
    source: C,
    state: RefCell<CoordinatorState<S>>,
    generation: Cell<u64>,
    alive: Cell<bool>,
    in_flight: Cell<usize>,
    debounce: RefCell<Option<JoinHandle<()>>>,
    watchers: RefCell<Vec<JoinHandle<()>>>,
}

/// Owns the mounted viewport and the fetch lifecycle for it. Must be created
/// and driven inside a `LocalSet`. Dropping it tears the viewport down.
pub struct Coordinator<S: MapSurface + 'static, C: ParcelSource + 'static> {
    inner: Rc<Inner<S, C>>,
}

impl<S: MapSurface + 'static, C: ParcelSource + 'static> Coordinator<S, C> {
    pub fn new(surface: S, source: C, config: CoordinatorConfig, filters: ParcelFilters) -> Self {
        Self {
            inner: Rc::new(Inner {
                config,
                source,
                state: RefCell::new(CoordinatorState {
                    handle: ViewportHandle::mount(surface),
                    filters,
                    items: Vec::new(),
                    count: 0,
                }),
                generation: Cell::new(0),
                alive: Cell::new(true),
                in_flight: Cell::new(0),
                debounce: RefCell::new(None),
                watchers: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Routes one widget event. Move-settle is debounced; load fires at once;
    /// zoom-settle only re-renders.
    pub fn handle_event(&self, event: ViewportEvent) {
        if !self.inner.alive.get() {
            return;
        }
        match event {
            ViewportEvent::Load => {
                self.refresh();
            }
            ViewportEvent::MoveEnd => self.inner.schedule_debounced(),
            ViewportEvent::ZoomEnd => self.inner.on_zoom_settled(),
            ViewportEvent::Click(click) => self.inner.on_click(click),
            ViewportEvent::PopupClosed(id) => {
                self.inner.state.borrow_mut().handle.markers.popup_closed(id);
            }
        }
    }

    /// Starts a cycle immediately, cancelling any pending debounced move.
    pub fn refresh(&self) -> JoinHandle<CycleOutcome> {
        self.inner.cancel_debounce();
        self.inner.start_cycle()
    }

    /// Validates and applies new filters, then refetches without debounce.
    /// Invalid filters are rejected and nothing is sent.
    pub fn apply_filters(
        &self,
        filters: ParcelFilters,
    ) -> Result<JoinHandle<CycleOutcome>, FilterValidationError> {
        filters.validate()?;
        self.inner.state.borrow_mut().filters = filters;
        Ok(self.refresh())
    }

    pub fn reset_filters(&self) -> JoinHandle<CycleOutcome> {
        self.inner.state.borrow_mut().filters = ParcelFilters::default();
        self.refresh()
    }

    /// Refetches whenever the session signs in or out, since the server
    /// scopes results by credential.
    pub fn follow_session(&self, mut changes: watch::Receiver<Option<Tokens>>) {
        let weak: Weak<Inner<S, C>> = Rc::downgrade(&self.inner);
        let task = spawn_local(async move {
            while changes.changed().await.is_ok() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.alive.get() {
                    break;
                }
                debug!("session changed; refreshing parcels");
                inner.cancel_debounce();
                inner.start_cycle();
            }
        });
        self.inner.watchers.borrow_mut().push(task);
    }

    /// Unmounts: later results become no-ops and everything on the map is
    /// removed. Idempotent.
    pub fn teardown(&self) {
        if !self.inner.alive.replace(false) {
            return;
        }
        self.inner.cancel_debounce();
        for task in self.inner.watchers.borrow_mut().drain(..) {
            task.abort();
        }
        self.inner.state.borrow_mut().handle.release();
        debug!("viewport torn down");
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.get()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.in_flight.get() > 0
    }

    pub fn filters(&self) -> ParcelFilters {
        self.inner.state.borrow().filters
    }

    pub fn items(&self) -> Vec<Parcel> {
        self.inner.state.borrow().items.clone()
    }

    pub fn count(&self) -> u64 {
        self.inner.state.borrow().count
    }

    pub fn status_text(&self) -> String {
        self.inner.status_text(&self.inner.state.borrow())
    }

    pub fn bounds(&self) -> BoundingBox {
        self.inner.state.borrow().handle.surface().bounds()
    }

    /// Last centroid result as point features.
    pub fn centroid_geojson(&self) -> FeatureCollection {
        centroids_to_feature_collection(&self.inner.state.borrow().items)
    }

    pub fn with_handle<R>(&self, f: impl FnOnce(&ViewportHandle<S>) -> R) -> R {
        f(&self.inner.state.borrow().handle)
    }

    pub fn with_surface<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(self.inner.state.borrow().handle.surface())
    }

    /// Direct access to the widget, e.g. to move the camera before emitting
    /// the matching settle event.
    pub fn with_surface_mut<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(self.inner.state.borrow_mut().handle.surface_mut())
    }
}

impl<S: MapSurface + 'static, C: ParcelSource + 'static> Drop for Coordinator<S, C> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<S: MapSurface + 'static, C: ParcelSource + 'static> Inner<S, C> {
    fn is_current(&self, generation: u64) -> bool {
        self.alive.get() && self.generation.get() == generation
    }

    fn cancel_debounce(&self) {
        if let Some(pending) = self.debounce.borrow_mut().take() {
            pending.abort();
        }
    }

    fn schedule_debounced(self: &Rc<Self>) {
        let inner = Rc::clone(self);
        let delay = self.config.move_debounce;
        let task = spawn_local(async move {
            tokio::time::sleep(delay).await;
            // Leave the slot before starting so a later abort can't hit us.
            inner.debounce.borrow_mut().take();
            if inner.alive.get() {
                inner.start_cycle();
            }
        });
        if let Some(previous) = self.debounce.borrow_mut().replace(task) {
            previous.abort();
        }
    }

    fn start_cycle(self: &Rc<Self>) -> JoinHandle<CycleOutcome> {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        let inner = Rc::clone(self);
        spawn_local(async move {
            inner.begin_loading();
            let outcome = inner.run_cycle(generation).await;
            inner.end_loading();
            outcome
        })
    }

    async fn run_cycle(&self, generation: u64) -> CycleOutcome {
        let (bbox, zoom, filters) = {
            let state = self.state.borrow();
            let surface = state.handle.surface();
            (surface.bounds(), surface.zoom(), state.filters)
        };
        debug!(generation, %bbox, zoom, "fetch cycle started");

        let request = FetchRequest {
            bbox,
            limit: self.config.centroid_limit,
            format: FetchFormat::Centroid,
            filters,
        };
        let result = self.source.fetch_parcels(request).await;
        if !self.is_current(generation) {
            debug!(generation, latest = self.generation.get(), "discarding stale centroid result");
            return CycleOutcome::Stale { generation };
        }
        let page = match result {
            Ok(ParcelPage::Centroids(page)) => page,
            Ok(other) => {
                let error = FetchError::Decode(format!(
                    "expected centroid page, got {}",
                    other.format()
                ));
                warn!(generation, error = %error, "failed to load parcels");
                return CycleOutcome::Failed { generation, error };
            }
            Err(error) => {
                warn!(generation, error = %error, "failed to load parcels");
                return CycleOutcome::Failed { generation, error };
            }
        };

        let count = page.count;
        let (rendered, eligible) = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            state.items = page.items;
            state.count = count;
            let (surface, markers, polygons) = state.handle.parts();
            // The camera may have moved while the request was in flight.
            let live_zoom = surface.zoom();
            markers.render(surface, &state.items, live_zoom);
            let rendered = markers.mounted_count();

            let eligible = self.config.polygon.is_eligible(live_zoom, count);
            if !eligible {
                polygons.teardown(surface);
                markers.close_feature_popup(surface);
            }
            (rendered, eligible)
        };
        self.publish_status();

        if !eligible {
            return CycleOutcome::Applied {
                generation,
                rendered,
                count,
                polygons: PolygonOutcome::Ineligible,
            };
        }

        let polygons = self.fetch_polygons(generation, bbox, filters).await;
        CycleOutcome::Applied {
            generation,
            rendered,
            count,
            polygons,
        }
    }

    async fn fetch_polygons(
        &self,
        generation: u64,
        bbox: BoundingBox,
        filters: ParcelFilters,
    ) -> PolygonOutcome {
        let request = FetchRequest {
            bbox,
            limit: self.config.polygon_limit,
            format: FetchFormat::Polygon,
            filters,
        };
        let result = self.source.fetch_parcels(request).await;
        if !self.is_current(generation) {
            debug!(generation, "discarding stale polygon result");
            return PolygonOutcome::Stale;
        }
        let page = match result {
            Ok(ParcelPage::Polygons(page)) => page,
            Ok(other) => {
                let error = FetchError::Decode(format!(
                    "expected polygon page, got {}",
                    other.format()
                ));
                warn!(generation, error = %error, "failed to load parcel polygons");
                return PolygonOutcome::Failed(error);
            }
            Err(error) => {
                warn!(generation, error = %error, "failed to load parcel polygons");
                return PolygonOutcome::Failed(error);
            }
        };

        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let count = state.count;
        let (surface, markers, polygons) = state.handle.parts();
        let still_eligible = self.config.polygon.is_eligible(surface.zoom(), count);
        match page.features() {
            Some(features) if still_eligible => {
                PolygonOutcome::Mounted(polygons.upsert(surface, features))
            }
            _ => {
                polygons.teardown(surface);
                markers.close_feature_popup(surface);
                PolygonOutcome::Cleared
            }
        }
    }

    /// Re-applies the marker cap for the new zoom from held items. Never
    /// fetches; drops the polygon layer if it no longer qualifies.
    fn on_zoom_settled(&self) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let count = state.count;
        let (surface, markers, polygons) = state.handle.parts();
        let zoom = surface.zoom();
        markers.render(surface, &state.items, zoom);
        if polygons.is_mounted() && !self.config.polygon.is_eligible(zoom, count) {
            polygons.teardown(surface);
            markers.close_feature_popup(surface);
        }
    }

    fn on_click(&self, click: MapClick) {
        let mut guard = self.state.borrow_mut();
        let (surface, markers, polygons) = guard.handle.parts();
        match click {
            MapClick::Marker { key } => markers.click_marker(surface, &key),
            MapClick::Feature {
                layer,
                lng,
                lat,
                feature,
            } => {
                if layer == FILL_LAYER_ID && polygons.is_mounted() {
                    let summary = FeatureSummary::from_feature(&feature);
                    markers.click_feature(surface, lng, lat, &summary);
                }
            }
            MapClick::Empty { .. } => markers.click_empty(surface),
        }
    }

    fn begin_loading(&self) {
        self.in_flight.set(self.in_flight.get() + 1);
        self.publish_status();
    }

    fn end_loading(&self) {
        self.in_flight.set(self.in_flight.get().saturating_sub(1));
        self.publish_status();
    }

    fn status_text(&self, state: &CoordinatorState<S>) -> String {
        if self.in_flight.get() > 0 {
            LOADING_TEXT.to_string()
        } else {
            format!("Points shown: {} (count: {})", state.items.len(), state.count)
        }
    }

    fn publish_status(&self) {
        if !self.alive.get() {
            return;
        }
        let mut state = self.state.borrow_mut();
        let text = self.status_text(&state);
        let loading = self.in_flight.get() > 0;
        let surface = state.handle.surface_mut();
        surface.set_loading(loading);
        surface.set_status(&text);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use parcel_atlas_shared::{CentroidResponse, Feature, PolygonResponse};
    use serde_json::json;
    use tokio::sync::oneshot;
    use tokio::task::LocalSet;

    use super::*;
    use crate::api::FetchFuture;
    use crate::polygon::{PolygonPolicy, SOURCE_ID};
    use crate::session::Session;
    use crate::session::tests::tokens_valid_for;
    use crate::viewport::HeadlessMap;

    type Reply = Result<ParcelPage, FetchError>;

    /// Records every request and holds its reply until the test releases it.
    #[derive(Default)]
    struct ScriptedSource {
        calls: RefCell<Vec<FetchRequest>>,
        replies: RefCell<Vec<Option<oneshot::Sender<Reply>>>>,
    }

    impl ScriptedSource {
        fn calls(&self) -> Vec<FetchRequest> {
            self.calls.borrow().clone()
        }

        fn reply(&self, index: usize, reply: Reply) {
            let sender = self.replies.borrow_mut()[index]
                .take()
                .expect("request already answered");
            let _ = sender.send(reply);
        }
    }

    impl ParcelSource for ScriptedSource {
        fn fetch_parcels(&self, request: FetchRequest) -> FetchFuture<'_> {
            self.calls.borrow_mut().push(request);
            let (tx, rx) = oneshot::channel();
            self.replies.borrow_mut().push(Some(tx));
            Box::pin(async move {
                rx.await
                    .unwrap_or_else(|_| Err(FetchError::Transport("dropped".to_string())))
            })
        }
    }

    type TestCoordinator = Coordinator<HeadlessMap, Rc<ScriptedSource>>;

    const DALLAS: BoundingBox = BoundingBox::new(-97.0, 32.0, -96.0, 33.0);

    fn parcel(id: &str, address: &str) -> Parcel {
        Parcel {
            sl_uuid: id.to_string(),
            address: Some(address.to_string()),
            county: "Dallas".to_string(),
            sqft: Some(1800.0),
            total_value: Some(250_000.0),
            lat: 32.5,
            lng: -96.5,
        }
    }

    fn parcels(n: usize) -> Vec<Parcel> {
        (0..n)
            .map(|i| parcel(&format!("p{i}"), &format!("{i} Elm St")))
            .collect()
    }

    fn centroids(items: Vec<Parcel>) -> Reply {
        Ok(ParcelPage::Centroids(CentroidResponse {
            count: items.len() as u64,
            items,
            applied: Default::default(),
        }))
    }

    fn centroids_with_count(items: Vec<Parcel>, count: u64) -> Reply {
        Ok(ParcelPage::Centroids(CentroidResponse {
            count,
            items,
            applied: Default::default(),
        }))
    }

    fn polygons(n: usize) -> Reply {
        let features = (0..n)
            .map(|i| {
                serde_json::from_value::<Feature>(json!({
                    "type": "Feature",
                    "geometry": {"type": "Polygon", "coordinates": []},
                    "properties": {"sl_uuid": format!("p{i}"), "address": "1 Poly Way", "county": "Dallas"}
                }))
                .expect("feature")
            })
            .collect();
        Ok(ParcelPage::Polygons(PolygonResponse {
            count: n as u64,
            geojson: Some(FeatureCollection {
                features,
                ..FeatureCollection::default()
            }),
            applied: Default::default(),
        }))
    }

    fn coordinator(zoom: f64) -> (TestCoordinator, Rc<ScriptedSource>) {
        let source = Rc::new(ScriptedSource::default());
        let config = CoordinatorConfig {
            polygon: PolygonPolicy {
                min_zoom: 14.0,
                min_count: 1,
                max_count: 100,
            },
            ..CoordinatorConfig::default()
        };
        let coordinator = Coordinator::new(
            HeadlessMap::new(DALLAS, zoom),
            Rc::clone(&source),
            config,
            ParcelFilters::default(),
        );
        (coordinator, source)
    }

    /// Lets every runnable local task make progress.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn run_local<F: std::future::Future<Output = ()>>(f: F) -> impl std::future::Future<Output = ()> {
        let local = LocalSet::new();
        async move { local.run_until(f).await }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn move_settles_are_debounced_to_the_last_viewport() {
        run_local(async {
            let (coordinator, source) = coordinator(12.0);

            for step in 0..3 {
                let shift = f64::from(step) * 0.1;
                coordinator.with_surface_mut(|map| {
                    map.set_view(
                        BoundingBox::new(-97.0 + shift, 32.0, -96.0 + shift, 33.0),
                        12.0,
                    )
                });
                coordinator.handle_event(ViewportEvent::MoveEnd);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            assert!(source.calls().is_empty(), "still inside the quiet window");

            tokio::time::sleep(Duration::from_millis(400)).await;
            let calls = source.calls();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].bbox, BoundingBox::new(-97.0 + 0.2, 32.0, -96.0 + 0.2, 33.0));
            assert_eq!(calls[0].format, FetchFormat::Centroid);
            assert_eq!(calls[0].limit, 1500);
            assert_eq!(coordinator.generation(), 1);
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn stale_response_never_overwrites_newer_state() {
        run_local(async {
            let (coordinator, source) = coordinator(12.0);

            let first = coordinator.refresh();
            settle().await;
            let second = coordinator.refresh();
            settle().await;
            assert_eq!(source.calls().len(), 2);

            source.reply(1, centroids(parcels(2)));
            settle().await;
            assert_eq!(coordinator.with_surface(|m| m.markers.len()), 2);

            source.reply(0, centroids(parcels(5)));
            settle().await;
            assert_eq!(coordinator.with_surface(|m| m.markers.len()), 2);
            assert_eq!(coordinator.count(), 2);

            assert_eq!(
                first.await.expect("first cycle"),
                CycleOutcome::Stale { generation: 1 }
            );
            assert!(matches!(
                second.await.expect("second cycle"),
                CycleOutcome::Applied { generation: 2, rendered: 2, .. }
            ));
            assert!(!coordinator.is_loading());
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn failed_fetch_keeps_last_good_state_and_clears_loading() {
        run_local(async {
            let (coordinator, source) = coordinator(12.0);

            coordinator.refresh();
            settle().await;
            source.reply(0, centroids(parcels(3)));
            settle().await;
            assert_eq!(coordinator.status_text(), "Points shown: 3 (count: 3)");

            let cycle = coordinator.refresh();
            settle().await;
            assert!(coordinator.is_loading());
            assert_eq!(coordinator.with_surface(|m| m.status.clone()), LOADING_TEXT);

            let error = FetchError::RequestFailed {
                status: 500,
                body: "boom".to_string(),
            };
            source.reply(1, Err(error.clone()));
            assert_eq!(
                cycle.await.expect("cycle"),
                CycleOutcome::Failed {
                    generation: 2,
                    error
                }
            );
            assert!(!coordinator.is_loading());
            coordinator.with_surface(|m| {
                assert_eq!(m.markers.len(), 3);
                assert!(!m.loading);
                assert_eq!(m.status, "Points shown: 3 (count: 3)");
            });
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn invalid_filters_are_blocked_and_valid_ones_fetch_immediately() {
        run_local(async {
            let (coordinator, source) = coordinator(12.0);

            let inverted = ParcelFilters {
                min_value: Some(500_000.0),
                max_value: Some(100_000.0),
                ..ParcelFilters::default()
            };
            assert!(matches!(
                coordinator.apply_filters(inverted),
                Err(FilterValidationError::ValueRange { .. })
            ));
            let not_a_number = ParcelFilters {
                min_value: Some(f64::NAN),
                ..ParcelFilters::default()
            };
            assert!(matches!(
                coordinator.apply_filters(not_a_number),
                Err(FilterValidationError::NonFinite { .. })
            ));
            settle().await;
            assert!(source.calls().is_empty());
            assert_eq!(coordinator.filters(), ParcelFilters::default());

            let ordered = ParcelFilters {
                min_value: Some(100_000.0),
                max_value: Some(500_000.0),
                ..ParcelFilters::default()
            };
            coordinator.apply_filters(ordered).expect("valid filters");
            settle().await;
            let calls = source.calls();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].filters, ordered);

            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(source.calls().len(), 1);
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn filter_apply_cancels_pending_move() {
        run_local(async {
            let (coordinator, source) = coordinator(12.0);
            coordinator.handle_event(ViewportEvent::MoveEnd);
            settle().await;
            coordinator.reset_filters();
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(source.calls().len(), 1);
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn polygons_fetched_when_zoomed_in_with_small_result() {
        run_local(async {
            let (coordinator, source) = coordinator(15.0);

            let cycle = coordinator.refresh();
            settle().await;
            source.reply(0, centroids(parcels(50)));
            settle().await;

            let calls = source.calls();
            assert_eq!(calls.len(), 2);
            assert_eq!(calls[1].format, FetchFormat::Polygon);
            assert_eq!(calls[1].limit, 200);
            assert_eq!(calls[1].bbox, DALLAS);

            source.reply(1, polygons(4));
            assert_eq!(
                cycle.await.expect("cycle"),
                CycleOutcome::Applied {
                    generation: 1,
                    rendered: 50,
                    count: 50,
                    polygons: PolygonOutcome::Mounted(PolygonMount::Added),
                }
            );
            coordinator.with_surface(|m| {
                assert_eq!(m.sources[SOURCE_ID].len(), 4);
                assert!(m.has_layer(FILL_LAYER_ID));
            });

            // A second eligible cycle updates the same layer in place.
            let again = coordinator.refresh();
            settle().await;
            source.reply(2, centroids(parcels(40)));
            settle().await;
            source.reply(3, polygons(2));
            assert!(matches!(
                again.await.expect("cycle"),
                CycleOutcome::Applied {
                    polygons: PolygonOutcome::Mounted(PolygonMount::Updated),
                    ..
                }
            ));
            coordinator.with_surface(|m| {
                assert_eq!(m.source_adds, 1);
                assert_eq!(m.sources[SOURCE_ID].len(), 2);
            });
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn too_many_matches_tears_polygons_down_without_fetching() {
        run_local(async {
            let (coordinator, source) = coordinator(15.0);

            coordinator.refresh();
            settle().await;
            source.reply(0, centroids(parcels(50)));
            settle().await;
            source.reply(1, polygons(3));
            settle().await;
            assert!(coordinator.with_handle(|h| h.polygons().is_mounted()));

            let cycle = coordinator.refresh();
            settle().await;
            source.reply(2, centroids_with_count(parcels(150), 150));
            assert!(matches!(
                cycle.await.expect("cycle"),
                CycleOutcome::Applied {
                    count: 150,
                    polygons: PolygonOutcome::Ineligible,
                    ..
                }
            ));
            assert_eq!(source.calls().len(), 3);
            coordinator.with_surface(|m| {
                assert!(!m.has_source(SOURCE_ID));
                assert!(m.layers.is_empty());
            });
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn empty_polygon_response_clears_the_layer() {
        run_local(async {
            let (coordinator, source) = coordinator(15.0);

            coordinator.refresh();
            settle().await;
            source.reply(0, centroids(parcels(10)));
            settle().await;
            source.reply(1, polygons(2));
            settle().await;

            let cycle = coordinator.refresh();
            settle().await;
            source.reply(2, centroids(parcels(10)));
            settle().await;
            source.reply(3, polygons(0));
            assert!(matches!(
                cycle.await.expect("cycle"),
                CycleOutcome::Applied {
                    polygons: PolygonOutcome::Cleared,
                    ..
                }
            ));
            assert!(!coordinator.with_surface(|m| m.has_source(SOURCE_ID)));
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn teardown_between_centroid_and_polygon_discards_polygons() {
        run_local(async {
            let (coordinator, source) = coordinator(15.0);

            let cycle = coordinator.refresh();
            settle().await;
            source.reply(0, centroids(parcels(20)));
            settle().await;
            assert_eq!(source.calls().len(), 2);

            coordinator.teardown();
            source.reply(1, polygons(5));
            assert!(matches!(
                cycle.await.expect("cycle"),
                CycleOutcome::Applied {
                    polygons: PolygonOutcome::Stale,
                    ..
                }
            ));
            coordinator.with_surface(|m| {
                assert!(m.markers.is_empty());
                assert!(!m.has_source(SOURCE_ID));
            });

            coordinator.handle_event(ViewportEvent::Load);
            settle().await;
            assert_eq!(source.calls().len(), 2);
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn polygon_result_for_a_superseded_cycle_is_not_mounted() {
        run_local(async {
            let (coordinator, source) = coordinator(15.0);

            let first = coordinator.refresh();
            settle().await;
            source.reply(0, centroids(parcels(20)));
            settle().await;
            assert_eq!(source.calls().len(), 2);
            assert_eq!(source.calls()[1].format, FetchFormat::Polygon);

            let second = coordinator.refresh();
            settle().await;
            assert_eq!(source.calls().len(), 3);

            source.reply(1, polygons(5));
            assert!(matches!(
                first.await.expect("first cycle"),
                CycleOutcome::Applied {
                    generation: 1,
                    polygons: PolygonOutcome::Stale,
                    ..
                }
            ));
            coordinator.with_surface(|m| {
                assert!(!m.has_source(SOURCE_ID));
                assert!(m.layers.is_empty());
            });

            source.reply(2, centroids(parcels(10)));
            settle().await;
            source.reply(3, polygons(2));
            assert!(matches!(
                second.await.expect("second cycle"),
                CycleOutcome::Applied {
                    generation: 2,
                    polygons: PolygonOutcome::Mounted(PolygonMount::Added),
                    ..
                }
            ));
            assert_eq!(coordinator.with_surface(|m| m.sources[SOURCE_ID].len()), 2);
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn errors_from_superseded_requests_are_reported_stale() {
        run_local(async {
            let (coordinator, source) = coordinator(15.0);
            let error = FetchError::Transport("connection reset".to_string());

            let first = coordinator.refresh();
            settle().await;
            let second = coordinator.refresh();
            settle().await;
            source.reply(0, Err(error.clone()));
            assert_eq!(
                first.await.expect("first cycle"),
                CycleOutcome::Stale { generation: 1 }
            );
            assert!(coordinator.is_loading());

            source.reply(1, centroids(parcels(20)));
            settle().await;
            assert_eq!(source.calls()[2].format, FetchFormat::Polygon);
            let third = coordinator.refresh();
            settle().await;

            source.reply(2, Err(error));
            assert!(matches!(
                second.await.expect("second cycle"),
                CycleOutcome::Applied {
                    generation: 2,
                    polygons: PolygonOutcome::Stale,
                    ..
                }
            ));

            source.reply(3, centroids_with_count(parcels(150), 150));
            assert!(matches!(
                third.await.expect("third cycle"),
                CycleOutcome::Applied {
                    generation: 3,
                    polygons: PolygonOutcome::Ineligible,
                    ..
                }
            ));
            assert!(!coordinator.is_loading());
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn zooming_out_during_the_centroid_fetch_skips_polygons() {
        run_local(async {
            let (coordinator, source) = coordinator(15.0);

            let cycle = coordinator.refresh();
            settle().await;
            coordinator.with_surface_mut(|m| m.set_view(DALLAS, 12.0));

            source.reply(0, centroids(parcels(30)));
            assert!(matches!(
                cycle.await.expect("cycle"),
                CycleOutcome::Applied {
                    count: 30,
                    polygons: PolygonOutcome::Ineligible,
                    ..
                }
            ));
            assert_eq!(source.calls().len(), 1);
            assert!(!coordinator.with_surface(|m| m.has_source(SOURCE_ID)));
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn zoom_settle_rerenders_from_held_items_without_fetching() {
        run_local(async {
            let (coordinator, source) = coordinator(10.0);

            coordinator.refresh();
            settle().await;
            source.reply(0, centroids(parcels(300)));
            settle().await;
            assert_eq!(coordinator.with_surface(|m| m.markers.len()), 120);

            coordinator.with_surface_mut(|m| m.set_view(DALLAS, 12.0));
            coordinator.handle_event(ViewportEvent::ZoomEnd);
            assert_eq!(coordinator.with_surface(|m| m.markers.len()), 250);

            coordinator.with_surface_mut(|m| m.set_view(DALLAS, 13.5));
            coordinator.handle_event(ViewportEvent::ZoomEnd);
            assert_eq!(coordinator.with_surface(|m| m.markers.len()), 300);

            settle().await;
            assert_eq!(source.calls().len(), 1);
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn zooming_out_drops_polygons_but_never_refetches_them() {
        run_local(async {
            let (coordinator, source) = coordinator(15.0);

            coordinator.refresh();
            settle().await;
            source.reply(0, centroids(parcels(30)));
            settle().await;
            source.reply(1, polygons(3));
            settle().await;

            coordinator.with_surface_mut(|m| m.set_view(DALLAS, 12.0));
            coordinator.handle_event(ViewportEvent::ZoomEnd);
            assert!(!coordinator.with_surface(|m| m.has_source(SOURCE_ID)));

            coordinator.with_surface_mut(|m| m.set_view(DALLAS, 15.0));
            coordinator.handle_event(ViewportEvent::ZoomEnd);
            settle().await;
            assert_eq!(source.calls().len(), 2);
            assert!(!coordinator.with_surface(|m| m.has_source(SOURCE_ID)));
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn end_to_end_markers_and_popup() {
        run_local(async {
            let (coordinator, source) = coordinator(12.0);
            let filters = ParcelFilters {
                min_sqft: Some(1500.0),
                ..ParcelFilters::default()
            };
            coordinator.apply_filters(filters).expect("valid filters");
            settle().await;

            let request = &source.calls()[0];
            assert_eq!(request.bbox, DALLAS);
            assert_eq!(
                request.query_pairs(),
                vec![
                    ("bbox", "-97,32,-96,33".to_string()),
                    ("limit", "1500".to_string()),
                    ("format", "centroid".to_string()),
                    ("minSqft", "1500".to_string()),
                ]
            );

            source.reply(
                0,
                centroids(vec![
                    parcel("a", "1 Elm St"),
                    parcel("b", "2 <Oak> & Sons"),
                    parcel("c", "3 Pine St"),
                ]),
            );
            settle().await;
            assert_eq!(coordinator.with_surface(|m| m.markers.len()), 3);

            coordinator.handle_event(ViewportEvent::Click(MapClick::Marker {
                key: "b".to_string(),
            }));
            coordinator.with_surface(|m| {
                assert_eq!(m.popups.len(), 1);
                let (_, popup) = m.open_popup().expect("popup");
                assert!(popup.html.contains("2 &lt;Oak&gt; &amp; Sons"));
            });

            coordinator.handle_event(ViewportEvent::Click(MapClick::Empty {
                lng: -96.2,
                lat: 32.2,
            }));
            assert!(coordinator.with_surface(|m| m.popups.is_empty()));
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn polygon_click_opens_feature_popup_and_close_button_resets() {
        run_local(async {
            let (coordinator, source) = coordinator(15.0);
            coordinator.refresh();
            settle().await;
            source.reply(0, centroids(parcels(5)));
            settle().await;
            source.reply(1, polygons(1));
            settle().await;

            coordinator.handle_event(ViewportEvent::Click(MapClick::Marker {
                key: "p1".to_string(),
            }));
            let feature = coordinator.with_surface(|m| m.sources[SOURCE_ID].features[0].clone());
            coordinator.handle_event(ViewportEvent::Click(MapClick::Feature {
                layer: FILL_LAYER_ID.to_string(),
                lng: -96.45,
                lat: 32.55,
                feature,
            }));
            let popup_id = coordinator.with_surface(|m| {
                assert_eq!(m.popups.len(), 1);
                let (id, popup) = m.open_popup().expect("feature popup");
                assert_eq!((popup.lng, popup.lat), (-96.45, 32.55));
                assert!(popup.html.contains("1 Poly Way"));
                id
            });

            coordinator.with_surface_mut(|m| m.remove_popup(popup_id));
            coordinator.handle_event(ViewportEvent::PopupClosed(popup_id));
            assert!(coordinator.with_handle(|h| h.markers().open_key().is_none()));
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn session_changes_trigger_a_refresh() {
        run_local(async {
            let (coordinator, source) = coordinator(12.0);
            let session = Session::anonymous();
            coordinator.follow_session(session.subscribe());
            settle().await;
            assert!(source.calls().is_empty());

            session.set_tokens(tokens_valid_for(3600)).expect("set tokens");
            settle().await;
            assert_eq!(source.calls().len(), 1);

            coordinator.teardown();
            session.clear().expect("clear");
            settle().await;
            assert_eq!(source.calls().len(), 1);
        })
        .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn centroid_geojson_excludes_unplottable_parcels() {
        run_local(async {
            let (coordinator, source) = coordinator(12.0);
            let mut items = parcels(3);
            items[1].lng = f64::NAN;
            coordinator.refresh();
            settle().await;
            source.reply(0, centroids(items));
            settle().await;

            assert_eq!(coordinator.items().len(), 3);
            assert_eq!(coordinator.with_surface(|m| m.markers.len()), 2);
            assert_eq!(coordinator.centroid_geojson().len(), 2);
        })
        .await;
    }
}
