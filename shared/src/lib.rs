pub mod bbox;
pub mod filters;
pub mod format;
pub mod geojson;
pub mod parcel;

pub use bbox::BoundingBox;
pub use filters::{FilterDraft, FilterValidationError, ParcelFilters};
pub use geojson::{Feature, FeatureCollection, FeatureSummary};
pub use parcel::{AppliedParams, CentroidResponse, FetchFormat, Parcel, ParcelPage, PolygonResponse};
