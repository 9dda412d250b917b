//! Delimited file reader with encoding and delimiter sniffing.

use std::borrow::Cow;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use taxroll_source_models::config::TextEncoding;

use crate::TransformError;

/// Bytes read to pick an encoding.
pub const ENCODING_SAMPLE_BYTES: usize = 8192;

/// Bytes read to pick a delimiter.
pub const DELIMITER_SAMPLE_BYTES: usize = 4096;

/// Windows-1252 code points for bytes 0x80..=0x9F. `None` marks the five
/// bytes the code page leaves undefined.
const CP1252_HIGH: [Option<char>; 32] = [
    Some('\u{20AC}'),
    None,
    Some('\u{201A}'),
    Some('\u{0192}'),
    Some('\u{201E}'),
    Some('\u{2026}'),
    Some('\u{2020}'),
    Some('\u{2021}'),
    Some('\u{02C6}'),
    Some('\u{2030}'),
    Some('\u{0160}'),
    Some('\u{2039}'),
    Some('\u{0152}'),
    None,
    Some('\u{017D}'),
    None,
    None,
    Some('\u{2018}'),
    Some('\u{2019}'),
    Some('\u{201C}'),
    Some('\u{201D}'),
    Some('\u{2022}'),
    Some('\u{2013}'),
    Some('\u{2014}'),
    Some('\u{02DC}'),
    Some('\u{2122}'),
    Some('\u{0161}'),
    Some('\u{203A}'),
    Some('\u{0153}'),
    None,
    Some('\u{017E}'),
    Some('\u{0178}'),
];

/// Field separator of a delimited file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delimiter {
    Tab,
    Pipe,
    Comma,
}

impl Delimiter {
    #[must_use]
    pub const fn byte(self) -> u8 {
        match self {
            Self::Tab => b'\t',
            Self::Pipe => b'|',
            Self::Comma => b',',
        }
    }
}

/// Picks the delimiter with the most occurrences in `sample`.
///
/// Ties go to tab, then pipe, then comma; appraisal exports are
/// tab-delimited and free-text columns often contain commas.
#[must_use]
pub fn detect_delimiter(sample: &str) -> Delimiter {
    let count = |c: char| sample.chars().filter(|&x| x == c).count();
    let tabs = count('\t');
    let pipes = count('|');
    let commas = count(',');
    if tabs >= pipes && tabs >= commas {
        Delimiter::Tab
    } else if pipes >= commas {
        Delimiter::Pipe
    } else {
        Delimiter::Comma
    }
}

/// Whether `sample` decodes cleanly as `encoding`.
///
/// A UTF-8 sequence cut off at the end of the sample still counts as
/// valid, since the sample is a prefix of the file.
#[must_use]
pub fn decodes_as(encoding: TextEncoding, sample: &[u8]) -> bool {
    match encoding {
        TextEncoding::Utf8 => match std::str::from_utf8(sample) {
            Ok(_) => true,
            Err(e) => e.error_len().is_none(),
        },
        TextEncoding::Latin1 => true,
        TextEncoding::Windows1252 => sample
            .iter()
            .all(|&b| !(0x80..=0x9F).contains(&b) || CP1252_HIGH[usize::from(b - 0x80)].is_some()),
    }
}

/// First candidate that decodes `sample`, falling back to Latin-1.
#[must_use]
pub fn detect_encoding(sample: &[u8], candidates: &[TextEncoding]) -> TextEncoding {
    candidates
        .iter()
        .copied()
        .find(|&e| decodes_as(e, sample))
        .unwrap_or(TextEncoding::Latin1)
}

/// Decodes bytes, replacing anything undecodable.
#[must_use]
pub fn decode(encoding: TextEncoding, bytes: &[u8]) -> Cow<'_, str> {
    if bytes.is_ascii() {
        return String::from_utf8_lossy(bytes);
    }
    match encoding {
        TextEncoding::Utf8 => String::from_utf8_lossy(bytes),
        TextEncoding::Latin1 => Cow::Owned(bytes.iter().map(|&b| char::from(b)).collect()),
        TextEncoding::Windows1252 => Cow::Owned(
            bytes
                .iter()
                .map(|&b| match b {
                    0x80..=0x9F => CP1252_HIGH[usize::from(b - 0x80)].unwrap_or('\u{FFFD}'),
                    _ => char::from(b),
                })
                .collect(),
        ),
    }
}

/// A delimited file opened for streaming, with normalized headers.
pub struct DelimitedReader {
    path: PathBuf,
    inner: csv::Reader<File>,
    /// Trimmed, lowercased header names.
    headers: Vec<String>,
    encoding: TextEncoding,
    delimiter: Delimiter,
}

impl DelimitedReader {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    #[must_use]
    pub const fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    #[must_use]
    pub const fn delimiter(&self) -> Delimiter {
        self.delimiter
    }

    /// Reads the next data row into `record`. Returns `false` at EOF.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::Csv`] on read errors.
    pub fn read_record(&mut self, record: &mut csv::ByteRecord) -> Result<bool, TransformError> {
        Ok(self.inner.read_byte_record(record)?)
    }

    /// Decodes one raw field with the file's encoding.
    #[must_use]
    pub fn decode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, str> {
        decode(self.encoding, bytes)
    }
}

/// Opens `path`, sniffing encoding and delimiter unless given.
///
/// Quote handling is enabled only for comma-delimited files; tab and pipe
/// exports carry literal `"` characters (inch marks, abbreviations) that
/// must not start a quoted field.
///
/// # Errors
///
/// Returns [`TransformError`] if the file cannot be opened or its header
/// row cannot be read.
pub fn open_reader(
    path: &Path,
    encodings: &[TextEncoding],
    delimiter: Option<Delimiter>,
) -> Result<DelimitedReader, TransformError> {
    let io = |source| TransformError::Io {
        path: path.display().to_string(),
        source,
    };

    let mut sample = Vec::with_capacity(ENCODING_SAMPLE_BYTES);
    File::open(path)
        .map_err(io)?
        .take(ENCODING_SAMPLE_BYTES as u64)
        .read_to_end(&mut sample)
        .map_err(io)?;

    let encoding = detect_encoding(&sample, encodings);
    let delimiter = delimiter.unwrap_or_else(|| {
        let head = &sample[..sample.len().min(DELIMITER_SAMPLE_BYTES)];
        detect_delimiter(&decode(encoding, head))
    });

    log::debug!(
        "Opening {} with encoding={encoding:?}, delimiter={delimiter:?}",
        path.display()
    );

    let mut inner = csv::ReaderBuilder::new()
        .delimiter(delimiter.byte())
        .quoting(delimiter == Delimiter::Comma)
        .flexible(true)
        .has_headers(true)
        .from_reader(File::open(path).map_err(io)?);

    let headers = inner
        .byte_headers()?
        .iter()
        .map(|h| {
            decode(encoding, h)
                .trim_start_matches('\u{FEFF}')
                .trim()
                .to_lowercase()
        })
        .collect();

    Ok(DelimitedReader {
        path: path.to_path_buf(),
        inner,
        headers,
        encoding,
        delimiter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_delimiters() {
        assert_eq!(detect_delimiter("a,b,c\n1,2,3"), Delimiter::Comma);
        assert_eq!(detect_delimiter("a\tb\tc\n1\t2\t3"), Delimiter::Tab);
        assert_eq!(detect_delimiter("a|b|c\n1|2|3"), Delimiter::Pipe);
        assert_eq!(detect_delimiter("a,b\tc\n1\t2,3"), Delimiter::Tab);
        assert_eq!(detect_delimiter("a|b,c"), Delimiter::Pipe);
        assert_eq!(detect_delimiter(""), Delimiter::Tab);
    }

    #[test]
    fn sniffs_encodings() {
        let all = [
            TextEncoding::Utf8,
            TextEncoding::Latin1,
            TextEncoding::Windows1252,
        ];
        assert_eq!(detect_encoding("Peña".as_bytes(), &all), TextEncoding::Utf8);
        assert_eq!(detect_encoding(b"Pe\xf1a", &all), TextEncoding::Latin1);
        assert_eq!(
            detect_encoding(b"Pe\xf1a \x93q\x94", &[TextEncoding::Utf8, TextEncoding::Windows1252]),
            TextEncoding::Windows1252
        );
        // A multibyte character cut off by the sample boundary.
        assert_eq!(detect_encoding(&"ñ".as_bytes()[..1], &all), TextEncoding::Utf8);
        // 0x81 is undefined in Windows-1252.
        assert!(!decodes_as(TextEncoding::Windows1252, b"\x81"));
    }

    #[test]
    fn decodes_single_byte_encodings() {
        assert_eq!(decode(TextEncoding::Latin1, b"Pe\xf1a"), "Peña");
        assert_eq!(
            decode(TextEncoding::Windows1252, b"\x93hi\x94 \x80"),
            "\u{201C}hi\u{201D} \u{20AC}"
        );
        assert_eq!(decode(TextEncoding::Utf8, b"plain"), "plain");
    }

    #[test]
    fn opens_with_normalized_headers() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("real_acct.txt");
        std::fs::write(&path, "\u{FEFF}ACCT \t Mailto\tsite_addr_1\n001\tSMITH \"BOB\"\t1 MAIN ST\n")
            .unwrap();

        let mut reader = open_reader(&path, &[TextEncoding::Utf8], None).unwrap();
        assert_eq!(reader.delimiter(), Delimiter::Tab);
        assert_eq!(reader.headers(), ["acct", "mailto", "site_addr_1"]);

        let mut row = csv::ByteRecord::new();
        assert!(reader.read_record(&mut row).unwrap());
        assert_eq!(reader.decode(&row[1]), "SMITH \"BOB\"");
        assert!(!reader.read_record(&mut row).unwrap());
    }
}
