use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use parcel_atlas_shared::{BoundingBox, FilterDraft};

use crate::config::INITIAL_ZOOM;

/// `parcel-atlas` - browse, filter and export parcels for a map viewport.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "parcel-atlas", version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run one synchronization pass for a viewport and print what the map shows.
    View(ViewArgs),
    /// Download the CSV export for a viewport.
    Export(ExportArgs),
    /// Print the identity provider sign-in URL.
    Login,
    /// Finish sign-in with the code from the redirect.
    Callback {
        #[arg(long)]
        code: String,
    },
    /// Forget local tokens and print the provider sign-out URL when configured.
    Logout,
    /// Show the signed-in user.
    #[command(name = "whoami")]
    WhoAmI,
    /// Manage the saved filters for the current user.
    #[command(subcommand)]
    Filters(FiltersAction),
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct ViewArgs {
    /// Viewport as `W,S,E,N` in degrees.
    #[arg(long, allow_hyphen_values = true)]
    pub bbox: BoundingBox,

    #[arg(long, default_value_t = INITIAL_ZOOM, value_parser = parse_zoom)]
    pub zoom: f64,

    #[command(flatten)]
    pub filters: FilterArgs,

    /// Also write the centroid result as GeoJSON to this path.
    #[arg(long)]
    pub geojson: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct ExportArgs {
    /// Viewport as `W,S,E,N` in degrees.
    #[arg(long, allow_hyphen_values = true)]
    pub bbox: BoundingBox,

    #[command(flatten)]
    pub filters: FilterArgs,

    /// Directory for `parcels_export.csv`; defaults to the working directory.
    #[arg(long = "out")]
    pub out_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum FiltersAction {
    Save(FilterArgs),
    Show,
    Clear,
}

/// Raw filter inputs; validated later through `FilterDraft::parse`.
#[derive(Args, Debug, Clone, PartialEq, Default)]
pub struct FilterArgs {
    #[arg(long)]
    pub min_value: Option<String>,
    #[arg(long)]
    pub max_value: Option<String>,
    #[arg(long)]
    pub min_sqft: Option<String>,
    #[arg(long)]
    pub max_sqft: Option<String>,
}

impl FilterArgs {
    /// `None` when no filter flag was given, meaning "use the saved filters".
    pub fn draft(&self) -> Option<FilterDraft> {
        let given = [
            &self.min_value,
            &self.max_value,
            &self.min_sqft,
            &self.max_sqft,
        ]
        .iter()
        .any(|flag| flag.is_some());
        given.then(|| FilterDraft {
            min_value: self.min_value.clone().unwrap_or_default(),
            max_value: self.max_value.clone().unwrap_or_default(),
            min_sqft: self.min_sqft.clone().unwrap_or_default(),
            max_sqft: self.max_sqft.clone().unwrap_or_default(),
        })
    }
}

fn parse_zoom(input: &str) -> Result<f64, String> {
    let zoom = input
        .parse::<f64>()
        .map_err(|e| format!("invalid zoom {input:?}: {e}"))?;
    if !zoom.is_finite() || zoom < 0.0 {
        return Err(format!("zoom must be a non-negative number, got {input:?}"));
    }
    Ok(zoom)
}
