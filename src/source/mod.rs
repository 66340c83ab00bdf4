//! Row Source: turns an uploaded batch file into ordered rows and column headers.
//!
//! Pipeline:
//! 1. Container detection from magic bytes (`format`)
//! 2. Decoding to a table of cells (`text` or `spreadsheet`)
//! 3. Normalization to one entry per row (this module)
//!
//! Rows are never validated here; a malformed row still becomes a row and
//! is reported when it is processed.

pub mod format;
pub mod spreadsheet;
pub mod text;

use std::path::Path;

use thiserror::Error;

pub use format::{detect_format, BatchFormat};

/// Headers of the old three-column layout, compared case-insensitively.
const OLD_STYLE_HEADER: [&str; 3] = ["AccNo", "Genesymbol", "Mutation"];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("File too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Spreadsheet could not be read: {0}")]
    Spreadsheet(String),

    #[error("Batch file contains no entries")]
    Empty,
}

/// Rows and column headers of an uploaded batch file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBatch {
    pub format: BatchFormat,
    /// One entry per input row, in order.
    pub rows: Vec<String>,
    /// Input column headers for the result artifact.
    pub columns: Vec<String>,
}

/// Source of batch rows for a submission.
pub trait RowSource: Send + Sync {
    /// Parse an uploaded file. Any error rejects the whole submission.
    fn parse(&self, bytes: &[u8]) -> Result<ParsedBatch, SourceError>;
}

/// Reads plain text (UTF-8, Windows-1252 fallback) and xls/xlsx/xlsb/ods.
#[derive(Debug, Clone)]
pub struct FileRowSource {
    max_bytes: u64,
}

impl FileRowSource {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    /// Parse a batch file on disk.
    pub fn read_path(&self, path: &Path) -> Result<ParsedBatch, SourceError> {
        let size = std::fs::metadata(path)?.len();
        self.check_size(size)?;
        let bytes = std::fs::read(path)?;
        self.parse(&bytes)
    }

    fn check_size(&self, size: u64) -> Result<(), SourceError> {
        if size > self.max_bytes {
            return Err(SourceError::FileTooLarge {
                size,
                max: self.max_bytes,
            });
        }
        Ok(())
    }
}

impl RowSource for FileRowSource {
    fn parse(&self, bytes: &[u8]) -> Result<ParsedBatch, SourceError> {
        self.check_size(bytes.len() as u64)?;

        let format = detect_format(bytes)?;
        let table = if format.is_spreadsheet() {
            spreadsheet::read_table(bytes, format)?
        } else {
            let (decoded, encoding) = text::decode(bytes)?;
            tracing::debug!(?encoding, "Decoded text batch file");
            text::split_rows(&decoded)
        };

        let (rows, columns) = normalize(table)?;
        tracing::info!(
            format = format.as_str(),
            rows = rows.len(),
            columns = columns.len(),
            "Parsed batch file"
        );
        Ok(ParsedBatch {
            format,
            rows,
            columns,
        })
    }
}

/// Turn a table of cells into entries: trim cells, drop trailing empty cells
/// and trailing blank rows, then apply the old three-column layout if the
/// first row announces it.
fn normalize(table: Vec<Vec<String>>) -> Result<(Vec<String>, Vec<String>), SourceError> {
    let mut rows: Vec<Vec<String>> = table
        .into_iter()
        .map(|row| {
            let mut cells: Vec<String> = row.iter().map(|c| c.trim().to_string()).collect();
            while cells.last().is_some_and(|c| c.is_empty()) {
                cells.pop();
            }
            cells
        })
        .collect();
    while rows.last().is_some_and(|r| r.is_empty()) {
        rows.pop();
    }
    if rows.is_empty() {
        return Err(SourceError::Empty);
    }

    if is_old_style_header(&rows[0]) {
        let entries = rows[1..].iter().map(|cells| old_style_entry(cells)).collect();
        let columns = OLD_STYLE_HEADER.iter().map(|c| c.to_string()).collect();
        return Ok((entries, columns));
    }

    let entries = rows.iter().map(|cells| cells.join("\t")).collect();
    Ok((entries, vec!["Input".to_string()]))
}

fn is_old_style_header(cells: &[String]) -> bool {
    cells.len() == OLD_STYLE_HEADER.len()
        && cells
            .iter()
            .zip(OLD_STYLE_HEADER)
            .all(|(cell, name)| cell.eq_ignore_ascii_case(name))
}

/// `AccNo(Genesymbol):Mutation`, or `AccNo:Mutation` without a gene symbol.
/// Anything else keeps its fields so processing reports it as malformed.
fn old_style_entry(cells: &[String]) -> String {
    match cells {
        [acc, gene, mutation] if !acc.is_empty() && !mutation.is_empty() => {
            if gene.is_empty() {
                format!("{acc}:{mutation}")
            } else {
                format!("{acc}({gene}):{mutation}")
            }
        }
        _ => cells.join("\t"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::spreadsheet::fixtures;

    const ENTRIES: &[&str] = &[
        "AB026906.1:c.274G>T",
        "AL449423.14(CDKN2A_v002):c.5_400del",
    ];

    fn source() -> FileRowSource {
        FileRowSource::new(1024 * 1024)
    }

    #[test]
    fn plain_text_rows() {
        let parsed = source()
            .parse(b"AB026906.1:c.274G>T\nAL449423.14(CDKN2A_v002):c.5_400del\n\n\n")
            .unwrap();
        assert_eq!(parsed.format, BatchFormat::PlainText);
        assert_eq!(parsed.rows, ENTRIES);
        assert_eq!(parsed.columns, vec!["Input"]);
    }

    const XLS_INPUT: &[u8] = include_bytes!("../../resources/fixtures/batch_input.xls");
    const XLSB_INPUT: &[u8] = include_bytes!("../../resources/fixtures/batch_input.xlsb");

    #[test]
    fn all_containers_normalize_to_the_same_rows() {
        let rows: Vec<&[&str]> = ENTRIES.iter().map(std::slice::from_ref).collect();
        let text = source().parse(ENTRIES.join("\n").as_bytes()).unwrap();

        let spreadsheets = [
            (BatchFormat::Ods, fixtures::ods(&rows)),
            (BatchFormat::Xlsx, fixtures::xlsx(&rows)),
            (BatchFormat::Xls, XLS_INPUT.to_vec()),
            (BatchFormat::Xlsb, XLSB_INPUT.to_vec()),
        ];
        for (format, bytes) in spreadsheets {
            let parsed = source().parse(&bytes).unwrap();
            assert_eq!(parsed.format, format);
            assert_eq!(parsed.rows, text.rows, "{format:?}");
            assert_eq!(parsed.columns, text.columns, "{format:?}");
        }
    }

    #[test]
    fn unrelated_binary_container_is_rejected() {
        let mut state: u32 = 7;
        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        png.extend((0..4096).map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (state >> 16) as u8
        }));
        assert!(matches!(
            source().parse(&png),
            Err(SourceError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn windows_1252_text() {
        let parsed = source()
            .parse(b"NM_003002.2:c.274G>T\nNM_003002.2:c.274G>T caf\xE9\n")
            .unwrap();
        assert_eq!(parsed.rows[1], "NM_003002.2:c.274G>T caf\u{e9}");
    }

    #[test]
    fn interior_blank_rows_are_kept() {
        let parsed = source().parse(b"a\n\nb\n").unwrap();
        assert_eq!(parsed.rows, vec!["a", "", "b"]);
    }

    #[test]
    fn multiple_fields_stay_tab_joined() {
        let parsed = source().parse(b"NM_003002.2\tSDHD\t\t\nb\n").unwrap();
        assert_eq!(parsed.rows, vec!["NM_003002.2\tSDHD", "b"]);
    }

    #[test]
    fn old_style_layout_is_combined() {
        let input = "AccNo\tGenesymbol\tMutation\n\
                     AB026906.1\tSDHD\tc.274G>T\n\
                     NM_003002.2\t\tc.274G>T\n\
                     NM_003002.2\tSDHD\n";
        let parsed = source().parse(input.as_bytes()).unwrap();
        assert_eq!(parsed.columns, vec!["AccNo", "Genesymbol", "Mutation"]);
        assert_eq!(
            parsed.rows,
            vec![
                "AB026906.1(SDHD):c.274G>T",
                "NM_003002.2:c.274G>T",
                "NM_003002.2\tSDHD",
            ]
        );
    }

    #[test]
    fn old_style_header_is_case_insensitive() {
        let parsed = source()
            .parse(b"accno\tGENESYMBOL\tmutation\nAB026906.1\tSDHD\tc.274G>T\n")
            .unwrap();
        assert_eq!(parsed.rows, vec!["AB026906.1(SDHD):c.274G>T"]);
    }

    #[test]
    fn unrelated_zip_is_unsupported() {
        use std::io::Write;
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("photo.jpg", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(&[0xFF, 0xD8, 0xFF, 0xE0]).unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        assert!(matches!(
            source().parse(&bytes),
            Err(SourceError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn empty_file_has_no_entries() {
        assert!(matches!(source().parse(b""), Err(SourceError::Empty)));
        assert!(matches!(source().parse(b"\n \n"), Err(SourceError::Empty)));
    }

    #[test]
    fn oversized_upload_is_rejected() {
        let source = FileRowSource::new(4);
        assert!(matches!(
            source.parse(b"AB026906.1:c.274G>T"),
            Err(SourceError::FileTooLarge { size: 19, max: 4 })
        ));
    }

    #[test]
    fn read_path_parses_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.txt");
        std::fs::write(&path, ENTRIES.join("\n")).unwrap();
        assert_eq!(source().read_path(&path).unwrap().rows, ENTRIES);

        let missing = dir.path().join("missing.txt");
        assert!(matches!(source().read_path(&missing), Err(SourceError::Io(_))));
    }
}
