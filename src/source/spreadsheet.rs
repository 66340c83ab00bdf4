//! Spreadsheet batch files. Only the first worksheet is read.

use std::io::Cursor;

use calamine::{Data, Ods, Range, Reader, Xls, Xlsb, Xlsx};

use super::format::BatchFormat;
use super::SourceError;

type Workbook = Cursor<Vec<u8>>;

/// Read the first worksheet as rows of cell text.
pub fn read_table(bytes: &[u8], format: BatchFormat) -> Result<Vec<Vec<String>>, SourceError> {
    let cursor = Cursor::new(bytes.to_vec());
    match format {
        BatchFormat::Xls => first_sheet(Xls::new(cursor).map_err(spreadsheet_error)?),
        BatchFormat::Xlsx => first_sheet(Xlsx::new(cursor).map_err(spreadsheet_error)?),
        BatchFormat::Xlsb => first_sheet(Xlsb::new(cursor).map_err(spreadsheet_error)?),
        BatchFormat::Ods => first_sheet(Ods::new(cursor).map_err(spreadsheet_error)?),
        BatchFormat::PlainText => Err(SourceError::UnsupportedFormat(
            "plain text is not a spreadsheet".into(),
        )),
    }
}

fn spreadsheet_error(e: impl std::fmt::Debug) -> SourceError {
    SourceError::Spreadsheet(format!("{e:?}"))
}

fn first_sheet<R: Reader<Workbook>>(mut workbook: R) -> Result<Vec<Vec<String>>, SourceError> {
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(SourceError::Empty)?
        .map_err(spreadsheet_error)?;
    Ok(range_rows(&range))
}

/// A range starts at its first used cell; pad it back to A1 so leading
/// blank rows and columns keep their positions.
fn range_rows(range: &Range<Data>) -> Vec<Vec<String>> {
    let Some((first_row, first_col)) = range.start() else {
        return Vec::new();
    };

    let mut rows: Vec<Vec<String>> = (0..first_row).map(|_| Vec::new()).collect();
    for row in range.rows() {
        let mut cells = vec![String::new(); first_col as usize];
        cells.extend(row.iter().map(cell_text));
        rows.push(cells);
    }
    rows
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        // Integral numbers as typed, not as `5.0`
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        other => other.to_string(),
    }
}
