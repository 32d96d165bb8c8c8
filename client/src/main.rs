use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::task::LocalSet;
use tracing_subscriber::EnvFilter;

use parcel_atlas_client::api::{ParcelClient, build_http_client};
use parcel_atlas_client::auth::{self, AuthError, PkceStore};
use parcel_atlas_client::cli::{Cli, Command, ExportArgs, FiltersAction, ViewArgs};
use parcel_atlas_client::config::{self, CoordinatorConfig, OidcConfig};
use parcel_atlas_client::coordinator::{Coordinator, CycleOutcome, PolygonOutcome};
use parcel_atlas_client::export;
use parcel_atlas_client::filter_store::FilterStore;
use parcel_atlas_client::session::Session;
use parcel_atlas_client::viewport::HeadlessMap;
use parcel_atlas_shared::{FilterDraft, ParcelFilters};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let command = Cli::parse().command;
    let state_dir = config::state_dir();
    let session = Session::load(&state_dir);

    match command {
        Command::View(view) => run_view(view, &state_dir, session).await,
        Command::Export(args) => run_export(args, &state_dir, session).await,
        Command::Login => {
            let oidc = require_oidc()?;
            let url = auth::begin_login(&oidc, &PkceStore::new(&state_dir))?;
            println!("Open this URL to sign in:\n{url}");
            Ok(())
        }
        Command::Callback { code } => {
            let oidc = require_oidc()?;
            let store = PkceStore::new(&state_dir);
            auth::handle_callback(&build_http_client(), &oidc, &store, &session, &code).await?;
            print_identity(&session);
            Ok(())
        }
        Command::Logout => {
            let oidc = OidcConfig::from_env();
            if let Some(url) = auth::logout(oidc.as_ref(), &PkceStore::new(&state_dir), &session)? {
                println!("Signed out locally. To end the provider session open:\n{url}");
            } else {
                println!("Signed out.");
            }
            Ok(())
        }
        Command::WhoAmI => {
            print_identity(&session);
            Ok(())
        }
        Command::Filters(action) => run_filters(action, &state_dir, &session),
    }
}

fn require_oidc() -> Result<OidcConfig> {
    Ok(OidcConfig::from_env().ok_or(AuthError::MissingConfig)?)
}

fn print_identity(session: &Session) {
    match session.user_sub() {
        Some(sub) if session.is_logged_in() => println!("Signed in as {sub}"),
        _ => println!("Not signed in (guest)"),
    }
}

/// Explicit filter flags win; otherwise the user's saved filters apply.
fn resolve_filters(
    draft: Option<&FilterDraft>,
    state_dir: &Path,
    session: &Session,
) -> Result<ParcelFilters> {
    match draft {
        Some(draft) => Ok(draft.parse()?),
        None => Ok(FilterStore::new(state_dir).load(session.user_sub().as_deref())),
    }
}

async fn run_view(view: ViewArgs, state_dir: &Path, session: Session) -> Result<()> {
    let filters = resolve_filters(view.filters.draft().as_ref(), state_dir, &session)?;
    let client = ParcelClient::new(build_http_client(), config::api_base_url(), session);
    tracing::info!(bbox = %view.bbox, zoom = view.zoom, base_url = client.base_url(), "loading viewport");

    let local = LocalSet::new();
    local
        .run_until(async move {
            let coordinator = Coordinator::new(
                HeadlessMap::new(view.bbox, view.zoom),
                client,
                CoordinatorConfig::from_env(),
                filters,
            );
            let outcome = coordinator.refresh().await?;
            match &outcome {
                CycleOutcome::Failed { error, .. } => bail!("failed to load parcels: {error}"),
                CycleOutcome::Stale { .. } => bail!("viewport closed before parcels loaded"),
                CycleOutcome::Applied { polygons, .. } => {
                    if let PolygonOutcome::Failed(error) = polygons {
                        tracing::warn!(error = %error, "parcel outlines unavailable");
                    }
                }
            }

            coordinator.with_surface(|map| {
                for marker in map.markers.values() {
                    println!(
                        "{}\t{:.6},{:.6}\t{}",
                        marker.key, marker.lat, marker.lng, marker.label
                    );
                }
            });
            let outlines = coordinator.with_handle(|handle| {
                let polygons = handle.polygons();
                polygons.is_mounted().then(|| polygons.feature_count())
            });
            if let Some(outlines) = outlines {
                println!("Parcel outlines: {outlines}");
            }
            println!("{}", coordinator.status_text());

            if let Some(path) = &view.geojson {
                let body = serde_json::to_vec_pretty(&coordinator.centroid_geojson())?;
                std::fs::write(path, body)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("GeoJSON written to {}", path.display());
            }
            coordinator.teardown();
            Ok::<(), anyhow::Error>(())
        })
        .await
}

async fn run_export(args: ExportArgs, state_dir: &Path, session: Session) -> Result<()> {
    let filters = resolve_filters(args.filters.draft().as_ref(), state_dir, &session)?;
    if !session.is_logged_in() {
        tracing::warn!("not signed in; the server may restrict the export");
    }
    let client = ParcelClient::new(build_http_client(), config::api_base_url(), session);
    let csv = export::download_csv(&client, &args.bbox, &filters, config::export_limit()).await?;
    let dir = args.out_dir.unwrap_or_else(|| Path::new(".").to_path_buf());
    let path = export::save_export(&dir, &csv)
        .with_context(|| format!("failed to save export under {}", dir.display()))?;
    println!("Export saved to {}", path.display());
    Ok(())
}

fn run_filters(action: FiltersAction, state_dir: &Path, session: &Session) -> Result<()> {
    let store = FilterStore::new(state_dir);
    let sub = session.user_sub();
    match action {
        FiltersAction::Save(args) => {
            let filters = args.draft().unwrap_or_default().parse()?;
            store.save(sub.as_deref(), &filters)?;
            println!("Filters saved: {}", serde_json::to_string(&filters)?);
        }
        FiltersAction::Show => {
            let filters = store.load(sub.as_deref());
            if filters.is_empty() {
                println!("No saved filters");
            } else {
                println!("{}", serde_json::to_string_pretty(&filters)?);
            }
        }
        FiltersAction::Clear => {
            store.clear(sub.as_deref())?;
            println!("Saved filters cleared");
        }
    }
    Ok(())
}
