use bytes::Bytes;
use futures::future::LocalBoxFuture;
use parcel_atlas_shared::{
    BoundingBox, CentroidResponse, FetchFormat, ParcelFilters, ParcelPage, PolygonResponse,
};
use reqwest::header::AUTHORIZATION;
use tracing::{debug, warn};

use crate::config::{http_connect_timeout, http_timeout};
use crate::session::Session;

const BODY_PREVIEW_CHARS: usize = 200;

/// One parcel query against the data API.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub bbox: BoundingBox,
    pub limit: u32,
    pub format: FetchFormat,
    pub filters: ParcelFilters,
}

impl FetchRequest {
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("bbox", self.bbox.to_query_value()),
            ("limit", self.limit.to_string()),
            ("format", self.format.as_str().to_string()),
        ];
        pairs.extend(self.filters.query_pairs());
        pairs
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
}

pub type FetchFuture<'a> = LocalBoxFuture<'a, Result<ParcelPage, FetchError>>;

/// Anything that can answer parcel queries. The coordinator only sees this.
pub trait ParcelSource {
    fn fetch_parcels(&self, request: FetchRequest) -> FetchFuture<'_>;
}

impl<T: ParcelSource + ?Sized> ParcelSource for std::rc::Rc<T> {
    fn fetch_parcels(&self, request: FetchRequest) -> FetchFuture<'_> {
        (**self).fetch_parcels(request)
    }
}

/// HTTP client for `GET {base}/parcels`.
#[derive(Clone)]
pub struct ParcelClient {
    http: reqwest::Client,
    base_url: String,
    session: Session,
}

pub fn build_http_client() -> reqwest::Client {
    let request_timeout = http_timeout();
    let connect_timeout = http_connect_timeout();
    reqwest::Client::builder()
        .user_agent(concat!("parcel-atlas/", env!("CARGO_PKG_VERSION")))
        .timeout(request_timeout)
        .connect_timeout(connect_timeout)
        .build()
        .or_else(|e| {
            warn!(
                error = %e,
                "failed to build configured HTTP client, retrying without custom user-agent"
            );
            reqwest::Client::builder()
                .timeout(request_timeout)
                .connect_timeout(connect_timeout)
                .build()
        })
        .unwrap_or_else(|e| {
            warn!(error = %e, "falling back to default HTTP client without timeouts");
            reqwest::Client::new()
        })
}

impl ParcelClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, session: Session) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET with the session's bearer credential attached when there is one.
    /// Non-2xx statuses become `RequestFailed` carrying the body text.
    pub(crate) async fn get_authorized(
        &self,
        path: &str,
        query: &[(&'static str, String)],
    ) -> Result<Bytes, FetchError> {
        let mut builder = self
            .http
            .get(format!("{}{path}", self.base_url))
            .query(query);
        match self.session.current_credential() {
            Some(credential) => {
                builder = builder.header(AUTHORIZATION, credential.authorization_value());
            }
            None => debug!(path, "no credential; sending unauthenticated request"),
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(FetchError::RequestFailed {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(bytes)
    }

    pub async fn fetch(&self, request: &FetchRequest) -> Result<ParcelPage, FetchError> {
        let bytes = self
            .get_authorized("/parcels", &request.query_pairs())
            .await?;
        decode_page(request.format, &bytes)
    }
}

impl ParcelSource for ParcelClient {
    fn fetch_parcels(&self, request: FetchRequest) -> FetchFuture<'_> {
        Box::pin(async move { self.fetch(&request).await })
    }
}

fn decode_page(format: FetchFormat, bytes: &[u8]) -> Result<ParcelPage, FetchError> {
    let decoded = match format {
        FetchFormat::Centroid => {
            serde_json::from_slice::<CentroidResponse>(bytes).map(ParcelPage::Centroids)
        }
        FetchFormat::Polygon => {
            serde_json::from_slice::<PolygonResponse>(bytes).map(ParcelPage::Polygons)
        }
    };
    decoded.map_err(|e| {
        let preview = String::from_utf8_lossy(bytes)
            .chars()
            .take(BODY_PREVIEW_CHARS)
            .collect::<String>();
        FetchError::Decode(format!("{e}; body preview: {preview}"))
    })
}
