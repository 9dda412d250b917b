//! Row and file transforms.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use taxroll_source_models::config::{TextEncoding, TransformConfig};

use crate::TransformError;
use crate::coerce::{CoerceOptions, coerce};
use crate::reader::{DelimitedReader, open_reader};
use crate::record::{MAX_ERRORS_PER_ROW, Record, RowOutcome, TransformResult, ValidationError};
use crate::schema::SchemaId;

const REQUIRED_EMPTY: &str = "required field is empty";

/// Applies table schemas to delimited files.
#[derive(Debug, Clone)]
pub struct Transformer {
    options: CoerceOptions,
    encodings: Vec<TextEncoding>,
    skip_invalid_records: bool,
    max_errors_before_abort: u64,
}

impl Transformer {
    #[must_use]
    pub fn new(config: &TransformConfig) -> Self {
        Self {
            options: CoerceOptions::from(config),
            encodings: config.encodings.clone(),
            skip_invalid_records: config.skip_invalid_records,
            max_errors_before_abort: config.max_errors_before_abort,
        }
    }

    /// Opens a file with sniffed encoding and delimiter.
    ///
    /// # Errors
    ///
    /// * If the file cannot be opened or its header row cannot be read
    pub fn open(&self, path: &Path) -> Result<DelimitedReader, TransformError> {
        open_reader(path, &self.encodings, None)
    }

    /// Transforms a single row keyed by column name. Column names are
    /// matched case-insensitively against each field's aliases.
    #[must_use]
    pub fn transform_row(
        &self,
        row: &HashMap<String, String>,
        schema: SchemaId,
        row_number: u64,
    ) -> RowOutcome {
        let (headers, cells): (Vec<String>, Vec<&str>) = row
            .iter()
            .map(|(k, v)| (k.trim().to_lowercase(), v.as_str()))
            .unzip();
        let columns = resolve_columns(schema, &headers);
        build_row(schema, &columns, self.options, row_number, |i| {
            cells.get(i).copied()
        })
    }

    /// Lazily transforms `path`. Every call re-opens the file, so the
    /// sequence can be consumed again from the start.
    ///
    /// `limit` caps the number of data rows read.
    ///
    /// # Errors
    ///
    /// * If the file cannot be opened or its header row cannot be read
    pub fn iter_records(
        &self,
        path: &Path,
        schema: SchemaId,
        limit: Option<u64>,
    ) -> Result<RecordIter, TransformError> {
        let reader = self.open(path)?;
        let columns = resolve_columns(schema, reader.headers());
        let mut result = TransformResult::new(schema, reader.encoding(), reader.delimiter());

        for (field, column) in schema.schema().fields.iter().zip(&columns) {
            if column.is_none() && field.required {
                result.warnings.push(format!(
                    "required column for '{}' not found in {}",
                    field.name,
                    path.display()
                ));
            }
        }
        let resolved = columns.iter().filter(|c| c.is_some()).count();
        log::debug!(
            "Transforming {} as {schema}: {:?}, {:?}, {resolved}/{} fields mapped",
            path.display(),
            reader.encoding(),
            reader.delimiter(),
            columns.len(),
        );

        Ok(RecordIter {
            path: path.to_path_buf(),
            reader,
            schema,
            columns,
            options: self.options,
            skip_invalid_records: self.skip_invalid_records,
            max_errors_before_abort: self.max_errors_before_abort,
            limit,
            buffer: csv::ByteRecord::new(),
            result,
            started: Instant::now(),
            done: false,
        })
    }

    /// Consumes the whole file and returns only the counters.
    ///
    /// # Errors
    ///
    /// * If the file cannot be opened or its header row cannot be read
    pub fn transform_file(
        &self,
        path: &Path,
        schema: SchemaId,
        limit: Option<u64>,
    ) -> Result<TransformResult, TransformError> {
        let mut records = self.iter_records(path, schema, limit)?;
        records.by_ref().for_each(drop);
        Ok(records.into_result())
    }
}

/// Pull-based record stream over one file.
///
/// Yields invalid rows as well so callers can count them; only
/// [`RowOutcome::Valid`] records should be loaded. Read errors end the
/// stream and are reported through [`RecordIter::result`].
pub struct RecordIter {
    path: PathBuf,
    reader: DelimitedReader,
    schema: SchemaId,
    columns: Vec<Option<usize>>,
    options: CoerceOptions,
    skip_invalid_records: bool,
    max_errors_before_abort: u64,
    limit: Option<u64>,
    buffer: csv::ByteRecord,
    result: TransformResult,
    started: Instant,
    done: bool,
}

impl RecordIter {
    #[must_use]
    pub const fn schema(&self) -> SchemaId {
        self.schema
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Counters so far.
    #[must_use]
    pub const fn result(&self) -> &TransformResult {
        &self.result
    }

    #[must_use]
    pub fn into_result(mut self) -> TransformResult {
        self.result.duration = self.started.elapsed();
        self.result
    }

    fn finish(&mut self, warning: Option<String>) {
        if let Some(warning) = warning {
            log::warn!("{}: {warning}", self.path.display());
            self.result.warnings.push(warning);
            self.result.success = false;
        }
        self.result.duration = self.started.elapsed();
        self.done = true;
    }

    fn next_row(&mut self) -> Option<RowOutcome> {
        loop {
            if self
                .limit
                .is_some_and(|limit| self.result.records_processed >= limit)
            {
                self.finish(None);
                return None;
            }

            match self.reader.read_record(&mut self.buffer) {
                Ok(true) => {}
                Ok(false) => {
                    self.finish(None);
                    return None;
                }
                Err(e) => {
                    self.finish(Some(format!(
                        "read error after row {}: {e}",
                        self.result.records_processed
                    )));
                    return None;
                }
            }

            self.result.records_processed += 1;
            let row_number = self.result.records_processed;

            if self
                .buffer
                .iter()
                .all(|cell| cell.iter().all(u8::is_ascii_whitespace))
            {
                self.result.records_skipped += 1;
                continue;
            }

            let reader = &self.reader;
            let buffer = &self.buffer;
            let outcome = build_row(
                self.schema,
                &self.columns,
                self.options,
                row_number,
                |i| buffer.get(i).map(|bytes| reader.decode(bytes)),
            );
            return Some(outcome);
        }
    }
}

impl Iterator for RecordIter {
    type Item = RowOutcome;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let outcome = self.next_row()?;

        match &outcome {
            RowOutcome::Valid(_) => self.result.records_valid += 1,
            RowOutcome::Invalid { errors, .. } => {
                self.result.records_invalid += 1;
                self.result.push_errors(errors);

                if !self.skip_invalid_records {
                    let row = errors.first().map_or(0, |e| e.row_number);
                    self.finish(Some(format!("Stopped at first invalid record (row {row})")));
                } else if self.result.records_invalid > self.max_errors_before_abort {
                    let invalid = self.result.records_invalid;
                    self.finish(Some(format!("Aborted after {invalid} invalid records")));
                }
            }
        }
        Some(outcome)
    }
}

fn resolve_columns(schema: SchemaId, headers: &[String]) -> Vec<Option<usize>> {
    schema
        .schema()
        .fields
        .iter()
        .map(|field| field.resolve(headers))
        .collect()
}

fn build_row<S, F>(
    schema: SchemaId,
    columns: &[Option<usize>],
    options: CoerceOptions,
    row_number: u64,
    cell: F,
) -> RowOutcome
where
    S: AsRef<str>,
    F: Fn(usize) -> Option<S>,
{
    let fields = schema.schema().fields;
    let mut values = Vec::with_capacity(fields.len());
    let mut errors = Vec::new();

    for (field, column) in fields.iter().zip(columns) {
        let raw = column.and_then(&cell);
        let raw = raw.as_ref().map(AsRef::<str>::as_ref);
        let value = coerce(raw, field, options);

        if field.required && value.is_empty() && errors.len() < MAX_ERRORS_PER_ROW {
            errors.push(ValidationError {
                field: field.name,
                value: raw.map(str::to_string),
                message: REQUIRED_EMPTY.to_string(),
                row_number,
            });
        }
        values.push(value);
    }

    let record = Record::from_values(schema, values);
    if errors.is_empty() {
        RowOutcome::Valid(record)
    } else {
        RowOutcome::Invalid { record, errors }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::record::Value;

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn transformer() -> Transformer {
        Transformer::new(&TransformConfig::default())
    }

    #[test]
    fn transforms_a_row_by_alias() {
        let row: HashMap<String, String> = [
            ("ACCT", "0021230000001"),
            ("Mailto", "  DOE   JANE "),
            ("tot_appr_val", "$250,000.00"),
            ("ignored", "x"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let outcome = transformer().transform_row(&row, SchemaId::RealAcct, 1);
        let RowOutcome::Valid(record) = outcome else {
            panic!("expected a valid row");
        };
        assert_eq!(record.str("account_number"), Some("0021230000001"));
        assert_eq!(record.str("owner_name"), Some("DOE JANE"));
        assert_eq!(record.float("value"), Some(250_000.0));
        assert_eq!(record.get("city"), Some(&Value::Null));
    }

    #[test]
    fn missing_required_field_is_invalid() {
        let row: HashMap<String, String> = [("acct", "   "), ("mailto", "X")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        match transformer().transform_row(&row, SchemaId::RealAcct, 7) {
            RowOutcome::Invalid { errors, .. } => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].field, "account_number");
                assert_eq!(errors[0].message, "required field is empty");
                assert_eq!(errors[0].value.as_deref(), Some("   "));
                assert_eq!(errors[0].row_number, 7);
            }
            RowOutcome::Valid(_) => panic!("expected an invalid row"),
        }
    }

    #[test]
    fn iterates_a_file_and_counts() {
        let file = write_file(
            "acct\tbld_num\tbed_rm\theat_ar\n\
             001\t1\t3\t1,850\n\
             \t1\t2\t900\n\
             \t\t\t\n\
             002\t2.0\t\t\n",
        );
        let t = transformer();
        let mut records = t.iter_records(file.path(), SchemaId::BuildingRes, None).unwrap();
        let valid: Vec<Record> = records
            .by_ref()
            .filter_map(|o| match o {
                RowOutcome::Valid(r) => Some(r),
                RowOutcome::Invalid { .. } => None,
            })
            .collect();
        let result = records.into_result();

        assert!(result.success);
        assert_eq!(result.records_processed, 4);
        assert_eq!(result.records_valid, 2);
        assert_eq!(result.records_invalid, 1);
        assert_eq!(result.records_skipped, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].row_number, 2);

        assert_eq!(valid[0].int("bedrooms"), Some(3));
        assert_eq!(valid[0].float("heat_area"), Some(1850.0));
        assert_eq!(valid[1].int("building_number"), Some(2));
        assert_eq!(valid[1].int("bedrooms"), None);
    }

    #[test]
    fn iteration_is_restartable() {
        let file = write_file("acct\n1\n2\n3\n");
        let t = transformer();
        let first = t.iter_records(file.path(), SchemaId::RealAcct, None).unwrap().count();
        let second = t.iter_records(file.path(), SchemaId::RealAcct, None).unwrap().count();
        assert_eq!(first, 3);
        assert_eq!(second, 3);

        let limited = t.transform_file(file.path(), SchemaId::RealAcct, Some(2)).unwrap();
        assert_eq!(limited.records_processed, 2);
        assert!(limited.success);
    }

    #[test]
    fn aborts_past_the_error_ceiling() {
        let mut body = String::from("acct|mailto\n");
        for _ in 0..10 {
            body.push_str("|nobody\n");
        }
        body.push_str("001|somebody\n");
        let file = write_file(&body);

        let config = TransformConfig {
            max_errors_before_abort: 3,
            ..TransformConfig::default()
        };
        let result = Transformer::new(&config)
            .transform_file(file.path(), SchemaId::RealAcct, None)
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.records_invalid, 4);
        assert_eq!(result.records_valid, 0);
        assert!(result.warnings.iter().any(|w| w == "Aborted after 4 invalid records"));
    }

    #[test]
    fn stops_at_first_invalid_when_not_skipping() {
        let file = write_file("acct\n001\n\n002\n \n003\n");
        let config = TransformConfig {
            skip_invalid_records: false,
            ..TransformConfig::default()
        };
        let result = Transformer::new(&config)
            .transform_file(file.path(), SchemaId::RealAcct, None)
            .unwrap();

        // Whitespace-only rows are skipped, not invalid, so every row loads.
        assert!(result.success);
        assert_eq!(result.records_valid, 3);

        let file = write_file("acct\tmailto\n001\ta\n\tb\n003\tc\n");
        let result = Transformer::new(&config)
            .transform_file(file.path(), SchemaId::RealAcct, None)
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.records_valid, 1);
        assert_eq!(result.records_invalid, 1);
    }

    #[test]
    fn warns_when_required_column_is_missing() {
        let file = write_file("mailto\tstr\nA\tMAIN\n");
        let result = transformer()
            .transform_file(file.path(), SchemaId::RealAcct, None)
            .unwrap();
        assert_eq!(result.records_invalid, 1);
        assert!(result.warnings[0].contains("account_number"));
    }
}
