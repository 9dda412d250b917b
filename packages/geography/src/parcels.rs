//! Parcel shapefile reduction.

use std::path::{Path, PathBuf};

use geo::{Centroid, Coord, LineString, MultiPoint, MultiPolygon, Point, Polygon};
use shapefile::dbase::{FieldValue, Record};
use shapefile::{PolygonRing, Shape};
use taxroll_database_models::CoordinateUpdate;
use taxroll_source_models::config::GisConfig;

use crate::GeoError;
use crate::projection::Projection;

/// Result of reading one parcels layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParcelCoordinates {
    pub updates: Vec<CoordinateUpdate>,
    /// Shapes read from the file.
    pub shapes: u64,
    /// Shapes with no usable geometry, no account key, or an out-of-range
    /// coordinate.
    pub failed: u64,
}

/// Finds the parcels layer under `dir`.
///
/// A `.shp` whose file name contains `preferred` wins; otherwise the first
/// shapefile in path order.
///
/// # Errors
///
/// * If `dir` cannot be read
/// * If it contains no shapefile
pub fn find_shapefile(dir: &Path, preferred: &str) -> Result<PathBuf, GeoError> {
    let mut found = Vec::new();
    collect_shapefiles(dir, &mut found)?;
    found.sort();

    let preferred = (!preferred.is_empty())
        .then(|| {
            found.iter().find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.contains(preferred))
            })
        })
        .flatten();

    preferred
        .or_else(|| found.first())
        .cloned()
        .ok_or_else(|| GeoError::NoShapefile {
            dir: dir.display().to_string(),
        })
}

fn collect_shapefiles(dir: &Path, found: &mut Vec<PathBuf>) -> Result<(), GeoError> {
    let entries = std::fs::read_dir(dir).map_err(|e| GeoError::io(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| GeoError::io(dir, e))?.path();
        if path.is_dir() {
            collect_shapefiles(&path, found)?;
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("shp"))
        {
            found.push(path);
        }
    }
    Ok(())
}

/// Reads every shape of `path` and returns one coordinate per keyed shape.
///
/// # Errors
///
/// * If the shapefile or its `.dbf` cannot be read
/// * If the `.prj` declares an unsupported projection
pub fn read_parcel_coordinates(
    path: &Path,
    config: &GisConfig,
) -> Result<ParcelCoordinates, GeoError> {
    let projection = Projection::for_shapefile(path)?;
    log::info!(
        "Reading parcels from {} ({})",
        path.display(),
        match projection {
            Projection::Geographic => "geographic",
            Projection::LambertConic(_) => "lambert conformal conic",
        }
    );

    let mut reader = shapefile::Reader::from_path(path)?;
    let mut result = ParcelCoordinates::default();

    for item in reader.iter_shapes_and_records() {
        let (shape, record) = item?;
        result.shapes += 1;

        let point = shape_centroid(&shape)
            .and_then(|(x, y)| projection.to_geographic(x, y));
        let key = record_key(&record, &config.key_fields);

        match (point, key) {
            (Some((latitude, longitude)), Some(account_number)) => {
                result.updates.push(CoordinateUpdate {
                    account_number,
                    latitude,
                    longitude,
                });
            }
            _ => result.failed += 1,
        }
    }

    log::info!(
        "Read {} shapes: {} with coordinates, {} failed",
        result.shapes,
        result.updates.len(),
        result.failed
    );
    Ok(result)
}

/// Digits in an account number. Numeric DBF keys lose their leading
/// zeros and are padded back to this width.
pub const ACCOUNT_WIDTH: usize = 13;

/// Account number from the first of `fields` present in `record`.
#[must_use]
pub fn record_key(record: &Record, fields: &[String]) -> Option<String> {
    fields.iter().find_map(|name| match record.get(name)? {
        FieldValue::Character(Some(s)) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        FieldValue::Numeric(Some(n)) if n.is_finite() => {
            Some(format!("{n:0width$.0}", width = ACCOUNT_WIDTH))
        }
        _ => None,
    })
}

/// Planar `(x, y)` representative point of a shape: the point itself, or
/// the centroid of a polygon, polyline or multipoint.
#[must_use]
pub fn shape_centroid(shape: &Shape) -> Option<(f64, f64)> {
    let point = match shape {
        Shape::NullShape => None,
        Shape::Point(p) => Some(Point::new(p.x, p.y)),
        Shape::PointM(p) => Some(Point::new(p.x, p.y)),
        Shape::PointZ(p) => Some(Point::new(p.x, p.y)),
        Shape::Polygon(p) => rings_centroid(p.rings(), |q| Coord { x: q.x, y: q.y }),
        Shape::PolygonM(p) => rings_centroid(p.rings(), |q| Coord { x: q.x, y: q.y }),
        Shape::PolygonZ(p) => rings_centroid(p.rings(), |q| Coord { x: q.x, y: q.y }),
        Shape::Multipoint(m) => {
            let points: MultiPoint = m.points().iter().map(|q| Point::new(q.x, q.y)).collect();
            points.centroid()
        }
        Shape::Polyline(l) => {
            let line: LineString = l
                .parts()
                .iter()
                .flatten()
                .map(|q| Coord { x: q.x, y: q.y })
                .collect();
            line.centroid()
        }
        _ => None,
    }?;
    (point.x().is_finite() && point.y().is_finite()).then(|| (point.x(), point.y()))
}

/// Groups rings into polygons (each outer ring starts a polygon, inner
/// rings are holes of the preceding one) and returns the area centroid.
fn rings_centroid<P>(rings: &[PolygonRing<P>], coord: impl Fn(&P) -> Coord) -> Option<Point> {
    let mut polygons: Vec<Polygon> = Vec::new();
    for ring in rings {
        match ring {
            PolygonRing::Outer(points) => {
                let exterior: LineString = points.iter().map(&coord).collect();
                polygons.push(Polygon::new(exterior, Vec::new()));
            }
            PolygonRing::Inner(points) => {
                let interior: LineString = points.iter().map(&coord).collect();
                match polygons.last_mut() {
                    Some(polygon) => polygon.interiors_push(interior),
                    None => polygons.push(Polygon::new(interior, Vec::new())),
                }
            }
        }
    }
    MultiPolygon::new(polygons).centroid()
}

#[cfg(test)]
mod tests {
    use shapefile::Point as ShpPoint;

    use super::*;

    fn square(x0: f64, y0: f64, side: f64) -> Vec<ShpPoint> {
        vec![
            ShpPoint::new(x0, y0),
            ShpPoint::new(x0, y0 + side),
            ShpPoint::new(x0 + side, y0 + side),
            ShpPoint::new(x0 + side, y0),
            ShpPoint::new(x0, y0),
        ]
    }

    #[test]
    fn points_map_directly() {
        let shape = Shape::Point(ShpPoint::new(-95.36, 29.76));
        assert_eq!(shape_centroid(&shape), Some((-95.36, 29.76)));
        assert_eq!(shape_centroid(&Shape::NullShape), None);
    }

    #[test]
    fn polygons_reduce_to_area_centroid() {
        let polygon = shapefile::Polygon::with_rings(vec![PolygonRing::Outer(square(0.0, 0.0, 4.0))]);
        let (x, y) = shape_centroid(&Shape::Polygon(polygon)).unwrap();
        assert!((x - 2.0).abs() < 1e-9 && (y - 2.0).abs() < 1e-9);
    }

    #[test]
    fn holes_shift_the_centroid() {
        let polygon = shapefile::Polygon::with_rings(vec![
            PolygonRing::Outer(square(0.0, 0.0, 4.0)),
            PolygonRing::Inner(square(0.0, 0.0, 2.0)),
        ]);
        let (x, y) = shape_centroid(&Shape::Polygon(polygon)).unwrap();
        assert!(x > 2.0 && y > 2.0, "({x}, {y})");
    }

    #[test]
    fn keys_come_from_the_first_present_field() {
        let fields = vec!["HCAD_NUM".to_string(), "ACCOUNT".to_string()];

        let mut record = Record::default();
        record.insert(
            "ACCOUNT".to_string(),
            FieldValue::Character(Some(" 0021230000001 ".to_string())),
        );
        assert_eq!(record_key(&record, &fields).as_deref(), Some("0021230000001"));

        record.insert("HCAD_NUM".to_string(), FieldValue::Numeric(Some(42.0)));
        assert_eq!(record_key(&record, &fields).as_deref(), Some("0000000000042"));

        let empty = Record::default();
        assert_eq!(record_key(&empty, &fields), None);
    }

    #[test]
    fn numeric_keys_match_zero_padded_accounts() {
        let fields = vec!["HCAD_NUM".to_string()];
        let mut record = Record::default();
        record.insert(
            "HCAD_NUM".to_string(),
            FieldValue::Numeric(Some(21_230_000_001.0)),
        );
        assert_eq!(record_key(&record, &fields).as_deref(), Some("0021230000001"));

        record.insert(
            "HCAD_NUM".to_string(),
            FieldValue::Numeric(Some(1_234_567_890_123.0)),
        );
        assert_eq!(record_key(&record, &fields).as_deref(), Some("1234567890123"));
    }

    #[test]
    fn prefers_named_layer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        for name in ["Abstracts.shp", "sub/ParcelsCity.shp", "Parcels.dbf"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let found = find_shapefile(dir.path(), "ParcelsCity").unwrap();
        assert!(found.ends_with("sub/ParcelsCity.shp"));

        let found = find_shapefile(dir.path(), "Missing").unwrap();
        assert!(found.ends_with("Abstracts.shp"));

        let empty = tempfile::tempdir().unwrap();
        assert!(matches!(
            find_shapefile(empty.path(), "ParcelsCity"),
            Err(GeoError::NoShapefile { .. })
        ));
    }
}
