//! Projection handling for shapefile coordinates.
//!
//! Only the two cases the parcel layers need are supported: geographic
//! coordinates, and Lambert Conformal Conic (two standard parallels) as
//! used by the State Plane zones. The inverse follows Snyder,
//! "Map Projections: A Working Manual", eqs. 15-1 to 15-11.

use std::collections::BTreeMap;
use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::GeoError;

static PROJECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"PROJECTION\["([^"]+)""#).expect("valid regex"));

static PARAMETER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"PARAMETER\["([^"]+)",\s*([-+0-9.eE]+)\s*\]"#).expect("valid regex")
});

static SPHEROID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"SPHEROID\["[^"]*",\s*([-+0-9.eE]+),\s*([-+0-9.eE]+)"#).expect("valid regex")
});

static UNIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"UNIT\["[^"]*",\s*([-+0-9.eE]+)"#).expect("valid regex"));

const MAX_LATITUDE_ITERATIONS: usize = 15;
const LATITUDE_TOLERANCE: f64 = 1e-12;

/// Coordinate system of a shapefile layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Longitude/latitude in degrees.
    Geographic,
    LambertConic(LambertConic),
}

impl Projection {
    /// Reads the `.prj` beside `shp`. A missing file means geographic.
    ///
    /// # Errors
    ///
    /// * If the `.prj` exists but cannot be read
    /// * If it declares an unsupported or malformed projection
    pub fn for_shapefile(shp: &Path) -> Result<Self, GeoError> {
        let prj = ["prj", "PRJ"]
            .iter()
            .map(|ext| shp.with_extension(ext))
            .find(|p| p.is_file());
        let Some(prj) = prj else {
            log::debug!("No .prj beside {}, assuming geographic", shp.display());
            return Ok(Self::Geographic);
        };
        let wkt = std::fs::read_to_string(&prj).map_err(|e| GeoError::io(&prj, e))?;
        Self::from_wkt(&wkt)
    }

    /// Parses ESRI or OGC well-known text.
    ///
    /// # Errors
    ///
    /// * If the projection is not Lambert Conformal Conic or geographic
    /// * If a required parameter is missing
    pub fn from_wkt(wkt: &str) -> Result<Self, GeoError> {
        let wkt = wkt.trim();
        if wkt.starts_with("GEOGCS") {
            return Ok(Self::Geographic);
        }
        if !wkt.starts_with("PROJCS") {
            return Err(GeoError::InvalidProjection {
                message: "expected PROJCS or GEOGCS".to_string(),
            });
        }

        let name = PROJECTION_RE
            .captures(wkt)
            .map(|c| c[1].to_string())
            .ok_or_else(|| GeoError::InvalidProjection {
                message: "PROJCS without PROJECTION".to_string(),
            })?;
        if !name.to_ascii_lowercase().starts_with("lambert_conformal_conic") {
            return Err(GeoError::UnsupportedProjection { name });
        }

        LambertConic::from_wkt(wkt).map(Self::LambertConic)
    }

    /// Converts layer coordinates to `(latitude, longitude)` in degrees.
    /// Returns `None` for results outside the valid range.
    #[must_use]
    pub fn to_geographic(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let (lat, lon) = match self {
            Self::Geographic => (y, x),
            Self::LambertConic(lcc) => lcc.inverse(x, y),
        };
        let valid = lat.is_finite()
            && lon.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lon);
        valid.then_some((lat, lon))
    }
}

/// Ellipsoidal Lambert Conformal Conic with precomputed constants.
#[derive(Debug, Clone, PartialEq)]
pub struct LambertConic {
    semi_major: f64,
    e: f64,
    n: f64,
    f: f64,
    rho0: f64,
    lon0: f64,
    false_easting: f64,
    false_northing: f64,
    /// Meters per layer unit.
    unit: f64,
}

/// Defining parameters, angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LambertConicParams {
    pub semi_major: f64,
    /// Zero for a sphere.
    pub inverse_flattening: f64,
    pub latitude_of_origin: f64,
    pub central_meridian: f64,
    pub standard_parallel_1: f64,
    pub standard_parallel_2: f64,
    /// In layer units.
    pub false_easting: f64,
    pub false_northing: f64,
    pub unit: f64,
}

fn m(e: f64, phi: f64) -> f64 {
    phi.cos() / (e * phi.sin()).mul_add(-(e * phi.sin()), 1.0).sqrt()
}

fn t(e: f64, phi: f64) -> f64 {
    let es = e * phi.sin();
    (FRAC_PI_4 - phi / 2.0).tan() / ((1.0 - es) / (1.0 + es)).powf(e / 2.0)
}

impl LambertConic {
    #[must_use]
    pub fn new(params: LambertConicParams) -> Self {
        let flattening = if params.inverse_flattening == 0.0 {
            0.0
        } else {
            1.0 / params.inverse_flattening
        };
        let e = (flattening * (2.0 - flattening)).sqrt();
        let phi0 = params.latitude_of_origin.to_radians();
        let phi1 = params.standard_parallel_1.to_radians();
        let phi2 = params.standard_parallel_2.to_radians();

        let (m1, m2) = (m(e, phi1), m(e, phi2));
        let (t0, t1, t2) = (t(e, phi0), t(e, phi1), t(e, phi2));
        let n = if (phi1 - phi2).abs() < 1e-10 {
            phi1.sin()
        } else {
            (m1.ln() - m2.ln()) / (t1.ln() - t2.ln())
        };
        let f = m1 / (n * t1.powf(n));

        Self {
            semi_major: params.semi_major,
            e,
            n,
            f,
            rho0: params.semi_major * f * t0.powf(n),
            lon0: params.central_meridian.to_radians(),
            false_easting: params.false_easting,
            false_northing: params.false_northing,
            unit: params.unit,
        }
    }

    fn from_wkt(wkt: &str) -> Result<Self, GeoError> {
        let parameters: BTreeMap<String, f64> = PARAMETER_RE
            .captures_iter(wkt)
            .filter_map(|c| Some((c[1].to_ascii_lowercase(), c[2].parse().ok()?)))
            .collect();
        let param = |name: &str| {
            parameters
                .get(name)
                .copied()
                .ok_or_else(|| GeoError::InvalidProjection {
                    message: format!("missing PARAMETER {name}"),
                })
        };

        let (semi_major, inverse_flattening) = SPHEROID_RE
            .captures(wkt)
            .and_then(|c| Some((c[1].parse().ok()?, c[2].parse().ok()?)))
            .ok_or_else(|| GeoError::InvalidProjection {
                message: "missing SPHEROID".to_string(),
            })?;

        // The projected unit is the last UNIT; earlier ones are angular.
        let unit = UNIT_RE
            .captures_iter(wkt)
            .last()
            .and_then(|c| c[1].parse().ok())
            .unwrap_or(1.0);

        let standard_parallel_1 = param("standard_parallel_1")?;
        Ok(Self::new(LambertConicParams {
            semi_major,
            inverse_flattening,
            latitude_of_origin: param("latitude_of_origin")?,
            central_meridian: param("central_meridian")?,
            standard_parallel_1,
            standard_parallel_2: param("standard_parallel_2").unwrap_or(standard_parallel_1),
            false_easting: parameters.get("false_easting").copied().unwrap_or(0.0),
            false_northing: parameters.get("false_northing").copied().unwrap_or(0.0),
            unit,
        }))
    }

    /// Projected `(x, y)` in layer units to `(latitude, longitude)` degrees.
    #[must_use]
    pub fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        let dx = (x - self.false_easting) * self.unit;
        let dy = (y - self.false_northing) * self.unit;
        let rho0_y = self.rho0 - dy;
        let sign = self.n.signum();

        let rho = sign * dx.hypot(rho0_y);
        if rho == 0.0 {
            return (sign * 90.0, self.lon0.to_degrees());
        }
        let theta = (sign * dx).atan2(sign * rho0_y);
        let t = (rho / (self.semi_major * self.f)).powf(1.0 / self.n);
        let lon = theta / self.n + self.lon0;

        let half_e = self.e / 2.0;
        let mut phi = 2.0f64.mul_add(-t.atan(), FRAC_PI_2);
        for _ in 0..MAX_LATITUDE_ITERATIONS {
            let es = self.e * phi.sin();
            let next = 2.0f64.mul_add(-(t * ((1.0 - es) / (1.0 + es)).powf(half_e)).atan(), FRAC_PI_2);
            let done = (next - phi).abs() < LATITUDE_TOLERANCE;
            phi = next;
            if done {
                break;
            }
        }
        (phi.to_degrees(), lon.to_degrees())
    }

    #[cfg(test)]
    fn forward(&self, lat: f64, lon: f64) -> (f64, f64) {
        let rho = self.semi_major * self.f * t(self.e, lat.to_radians()).powf(self.n);
        let theta = self.n * (lon.to_radians() - self.lon0);
        (
            rho * theta.sin() / self.unit + self.false_easting,
            rho.mul_add(-theta.cos(), self.rho0) / self.unit + self.false_northing,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXAS_SOUTH_CENTRAL: &str = r#"PROJCS["NAD_1983_StatePlane_Texas_South_Central_FIPS_4204_Feet",GEOGCS["GCS_North_American_1983",DATUM["D_North_American_1983",SPHEROID["GRS_1980",6378137.0,298.257222101]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]],PROJECTION["Lambert_Conformal_Conic"],PARAMETER["False_Easting",1968500.0],PARAMETER["False_Northing",13123333.33333333],PARAMETER["Central_Meridian",-99.0],PARAMETER["Standard_Parallel_1",28.38333333333333],PARAMETER["Standard_Parallel_2",30.28333333333333],PARAMETER["Latitude_Of_Origin",27.83333333333333],UNIT["Foot_US",0.3048006096012192]]"#;

    fn lcc() -> LambertConic {
        match Projection::from_wkt(TEXAS_SOUTH_CENTRAL).unwrap() {
            Projection::LambertConic(lcc) => lcc,
            Projection::Geographic => panic!("expected a projected system"),
        }
    }

    fn close(a: f64, b: f64, tolerance: f64) -> bool {
        (a - b).abs() < tolerance
    }

    #[test]
    fn origin_inverts_to_origin() {
        let (lat, lon) = lcc().inverse(1_968_500.0, 13_123_333.333_333_33);
        assert!(close(lat, 27.833_333_333_333_33, 1e-9), "{lat}");
        assert!(close(lon, -99.0, 1e-9), "{lon}");
    }

    #[test]
    fn inverts_state_plane_feet() {
        let (lat, lon) = lcc().inverse(3_120_099.087_756, 13_841_900.858_474);
        assert!(close(lat, 29.7604, 1e-6), "{lat}");
        assert!(close(lon, -95.3698, 1e-6), "{lon}");
    }

    #[test]
    fn forward_and_inverse_agree() {
        let lcc = lcc();
        for (lat, lon) in [(29.0, -95.0), (30.5, -96.2), (28.1, -98.7)] {
            let (x, y) = lcc.forward(lat, lon);
            let (back_lat, back_lon) = lcc.inverse(x, y);
            assert!(close(back_lat, lat, 1e-9));
            assert!(close(back_lon, lon, 1e-9));
        }
    }

    #[test]
    fn geographic_and_unsupported() {
        let geographic = r#"GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]]"#;
        assert_eq!(Projection::from_wkt(geographic).unwrap(), Projection::Geographic);
        assert_eq!(
            Projection::Geographic.to_geographic(-95.36, 29.76),
            Some((29.76, -95.36))
        );
        assert_eq!(Projection::Geographic.to_geographic(3_000_000.0, 29.0), None);

        let mercator = TEXAS_SOUTH_CENTRAL.replace("Lambert_Conformal_Conic", "Mercator");
        assert!(matches!(
            Projection::from_wkt(&mercator),
            Err(GeoError::UnsupportedProjection { .. })
        ));
        assert!(Projection::from_wkt("garbage").is_err());
    }

    #[test]
    fn reads_prj_beside_shapefile() {
        let dir = tempfile::tempdir().unwrap();
        let shp = dir.path().join("Parcels.shp");
        assert_eq!(Projection::for_shapefile(&shp).unwrap(), Projection::Geographic);

        std::fs::write(dir.path().join("Parcels.prj"), TEXAS_SOUTH_CENTRAL).unwrap();
        assert!(matches!(
            Projection::for_shapefile(&shp).unwrap(),
            Projection::LambertConic(_)
        ));
    }
}
