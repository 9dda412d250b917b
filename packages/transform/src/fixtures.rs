//! Bedroom and bathroom counts from the building fixtures file.
//!
//! Room counts are not columns of the building table. They arrive as
//! separate fixture rows (`acct, bld_num, type, type_dscr, units`) keyed by
//! type code, so the file is scanned once up front and the latest count per
//! building and code is kept.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

pub const BEDROOM_CODE: &str = "RMB";
pub const FULL_BATH_CODE: &str = "RMF";
pub const HALF_BATH_CODE: &str = "RMH";

const PROGRESS_EVERY: u64 = 100_000;

/// Room counts for one building. Missing counts are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RoomCounts {
    pub bedrooms: f64,
    pub full_baths: f64,
    pub half_baths: f64,
}

impl RoomCounts {
    /// Full baths plus half a bath per half bath.
    #[must_use]
    pub fn bathrooms(&self) -> f64 {
        self.half_baths.mul_add(0.5, self.full_baths)
    }

    #[must_use]
    pub fn has_bathrooms(&self) -> bool {
        self.full_baths > 0.0 || self.half_baths > 0.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixtureStats {
    pub total_buildings: usize,
    pub with_bedrooms: usize,
    pub with_full_baths: usize,
    pub with_half_baths: usize,
    pub with_bathrooms: usize,
    pub with_both: usize,
}

/// Lookup from `(account, building number)` to [`RoomCounts`].
#[derive(Debug, Default, Clone)]
pub struct FixturesAggregator {
    cache: HashMap<(String, i64), RoomCounts>,
}

impl FixturesAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the cache with the contents of `path`.
    ///
    /// Failure is never fatal: a missing or unreadable file leaves the
    /// cache empty and building loads fall back to their own columns.
    /// Returns the number of room-count rows applied.
    pub fn load_fixtures_file(&mut self, path: &Path) -> u64 {
        self.cache.clear();
        log::info!("Loading fixtures from {}", path.display());

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("Fixtures file not readable: {}: {e}", path.display());
                return 0;
            }
        };
        self.load_from_reader(file)
    }

    /// Replaces the cache with fixture rows read from `reader`. The first
    /// line is a header.
    pub fn load_from_reader<R: Read>(&mut self, reader: R) -> u64 {
        self.cache.clear();

        let mut csv = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .quoting(false)
            .flexible(true)
            .has_headers(true)
            .from_reader(reader);

        let mut lines = 0u64;
        let mut applied = 0u64;
        let mut record = csv::ByteRecord::new();

        loop {
            match csv.read_byte_record(&mut record) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    log::error!("Error reading fixtures after line {lines}: {e}");
                    break;
                }
            }
            lines += 1;
            if lines % PROGRESS_EVERY == 0 {
                log::info!("Processed {lines} fixture lines...");
            }
            match parse_line(&record) {
                Some((key, code, units)) => {
                    let counts = self.cache.entry(key).or_default();
                    match code {
                        Code::Bedrooms => counts.bedrooms = units,
                        Code::FullBaths => counts.full_baths = units,
                        Code::HalfBaths => counts.half_baths = units,
                    }
                    applied += 1;
                }
                None => log::trace!("Skipping fixture line {lines}"),
            }
        }

        log::info!(
            "Loaded fixtures for {} buildings from {lines} lines ({applied} bedroom/bathroom records)",
            self.cache.len()
        );
        applied
    }

    /// Counts for a building, or all zeros if it has none.
    #[must_use]
    pub fn fixtures(&self, account_number: &str, building_number: i64) -> RoomCounts {
        self.cache
            .get(&(account_number.to_string(), building_number))
            .copied()
            .unwrap_or_default()
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn bedroom_count(&self, account_number: &str, building_number: i64) -> u32 {
        self.fixtures(account_number, building_number)
            .bedrooms
            .max(0.0) as u32
    }

    #[must_use]
    pub fn bathroom_count(&self, account_number: &str, building_number: i64) -> f64 {
        self.fixtures(account_number, building_number).bathrooms()
    }

    #[must_use]
    pub fn stats(&self) -> FixtureStats {
        let mut stats = FixtureStats {
            total_buildings: self.cache.len(),
            ..FixtureStats::default()
        };
        for counts in self.cache.values() {
            let bedrooms = counts.bedrooms > 0.0;
            stats.with_bedrooms += usize::from(bedrooms);
            stats.with_full_baths += usize::from(counts.full_baths > 0.0);
            stats.with_half_baths += usize::from(counts.half_baths > 0.0);
            stats.with_bathrooms += usize::from(counts.has_bathrooms());
            stats.with_both += usize::from(bedrooms && counts.has_bathrooms());
        }
        stats
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        log::debug!("Fixtures cache cleared");
    }
}

#[derive(Debug, Clone, Copy)]
enum Code {
    Bedrooms,
    FullBaths,
    HalfBaths,
}

fn parse_line(record: &csv::ByteRecord) -> Option<((String, i64), Code, f64)> {
    if record.len() < 5 {
        return None;
    }
    let field = |i: usize| record.get(i).map(|b| String::from_utf8_lossy(b).trim().to_string());

    let code = match field(2)?.as_str() {
        BEDROOM_CODE => Code::Bedrooms,
        FULL_BATH_CODE => Code::FullBaths,
        HALF_BATH_CODE => Code::HalfBaths,
        _ => return None,
    };
    let account = field(0)?;
    let building = field(1)?.parse::<i64>().ok()?;
    let units = field(4)?.parse::<f64>().ok()?;
    Some(((account, building), code, units))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "acct\tbld_num\ttype\ttype_dscr\tunits\n\
        0001\t1\tRMB\tRoom: Bedroom\t4.00\n\
        0001\t1\tRMF\tRoom: Full Bath\t2.00\n\
        0001\t1\tRMH\tRoom: Half Bath\t1.00\n\
        0001\t1\tFPL\tFireplace\t1.00\n\
        0002\t1\tRMB\tRoom: Bedroom\t2.00\n\
        0002\t1\tRMB\tRoom: Bedroom\t3.00\n\
        0003\t1\tRMF\tRoom: Full Bath\t1.00\n\
        0004\tx\tRMB\tRoom: Bedroom\t1.00\n\
        0005\t1\tRMB\n";

    fn loaded() -> FixturesAggregator {
        let mut fixtures = FixturesAggregator::new();
        fixtures.load_from_reader(SAMPLE.as_bytes());
        fixtures
    }

    #[test]
    fn aggregates_room_counts() {
        let fixtures = loaded();
        assert_eq!(fixtures.bedroom_count("0001", 1), 4);
        assert!((fixtures.bathroom_count("0001", 1) - 2.5).abs() < f64::EPSILON);
        assert!((fixtures.fixtures("0001", 1).half_baths - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn last_write_wins() {
        assert_eq!(loaded().bedroom_count("0002", 1), 3);
    }

    #[test]
    fn unknown_buildings_are_zero() {
        let fixtures = loaded();
        assert_eq!(fixtures.fixtures("0001", 2), RoomCounts::default());
        assert_eq!(fixtures.bedroom_count("0004", 1), 0);
        assert_eq!(fixtures.bedroom_count("0005", 1), 0);
    }

    #[test]
    fn stats() {
        let stats = loaded().stats();
        assert_eq!(
            stats,
            FixtureStats {
                total_buildings: 3,
                with_bedrooms: 2,
                with_full_baths: 2,
                with_half_baths: 1,
                with_bathrooms: 2,
                with_both: 1,
            }
        );
    }

    #[test]
    fn missing_file_is_not_fatal() {
        let mut fixtures = loaded();
        let dir = tempfile::tempdir().unwrap();
        let applied = fixtures.load_fixtures_file(&dir.path().join("fixtures.txt"));
        assert_eq!(applied, 0);
        assert!(fixtures.is_empty());
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixtures.txt");
        std::fs::write(&path, SAMPLE).unwrap();

        let mut fixtures = FixturesAggregator::new();
        assert_eq!(fixtures.load_fixtures_file(&path), 6);
        assert_eq!(fixtures.len(), 3);
        fixtures.clear();
        assert!(fixtures.is_empty());
    }
}
