#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Parcel coordinates from the appraisal district's GIS layer.
//!
//! The parcels shapefile is reduced to one `(latitude, longitude)` per
//! account: point shapes are used as-is and polygons are replaced by their
//! area centroid. Layers published in a Lambert Conformal Conic state plane
//! projection are inverse-projected to geographic degrees.

pub mod parcels;
pub mod projection;

pub use parcels::{ParcelCoordinates, find_shapefile, read_parcel_coordinates};
pub use projection::Projection;

use thiserror::Error;

/// Errors that can occur during geography operations.
#[derive(Debug, Error)]
pub enum GeoError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Shapefile error: {0}")]
    Shapefile(#[from] shapefile::Error),

    #[error("No shapefile found under {dir}")]
    NoShapefile { dir: String },

    /// The `.prj` declares a projection with no inverse implemented here.
    #[error("Unsupported projection: {name}")]
    UnsupportedProjection { name: String },

    #[error("Invalid projection definition: {message}")]
    InvalidProjection { message: String },
}

impl GeoError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
