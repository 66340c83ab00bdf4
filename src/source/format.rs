use std::io::{Cursor, Read};

use serde::{Deserialize, Serialize};

use super::SourceError;

const ODS_MIMETYPE: &str = "application/vnd.oasis.opendocument.spreadsheet";

/// Containers a batch file may come in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BatchFormat {
    PlainText,
    Xls,
    Xlsx,
    Xlsb,
    Ods,
}

impl BatchFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlainText => "plain_text",
            Self::Xls => "xls",
            Self::Xlsx => "xlsx",
            Self::Xlsb => "xlsb",
            Self::Ods => "ods",
        }
    }

    pub fn is_spreadsheet(&self) -> bool {
        !matches!(self, Self::PlainText)
    }
}

/// Detect the container from magic bytes, looking inside ZIP archives.
/// Anything that is not a known container is treated as text; the text
/// decoder rejects binary content.
pub fn detect_format(bytes: &[u8]) -> Result<BatchFormat, SourceError> {
    match bytes {
        // OLE2 compound document (Excel 97-2003)
        [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1, ..] => Ok(BatchFormat::Xls),
        // ZIP local file header or empty archive
        [0x50, 0x4B, 0x03, 0x04, ..] | [0x50, 0x4B, 0x05, 0x06, ..] => detect_zip(bytes),
        _ => Ok(BatchFormat::PlainText),
    }
}

fn detect_zip(bytes: &[u8]) -> Result<BatchFormat, SourceError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| SourceError::UnsupportedFormat(format!("unreadable ZIP archive: {e}")))?;

    if let Ok(mut entry) = archive.by_name("mimetype") {
        let mut mimetype = String::new();
        // A non-UTF-8 mimetype simply is not ODS.
        if entry.read_to_string(&mut mimetype).is_ok() && mimetype.trim() == ODS_MIMETYPE {
            return Ok(BatchFormat::Ods);
        }
    }

    let has = |name: &str| archive.file_names().any(|n| n == name);
    if has("xl/workbook.xml") {
        Ok(BatchFormat::Xlsx)
    } else if has("xl/workbook.bin") {
        Ok(BatchFormat::Xlsb)
    } else {
        Err(SourceError::UnsupportedFormat(
            "ZIP archive is not a spreadsheet".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn plain_text_is_text() {
        assert_eq!(
            detect_format(b"AB026906.1:c.274G>T\n").unwrap(),
            BatchFormat::PlainText
        );
        assert_eq!(detect_format(b"").unwrap(), BatchFormat::PlainText);
    }

    #[test]
    fn ole2_is_xls() {
        let header = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1, 0x00, 0x00];
        assert_eq!(detect_format(&header).unwrap(), BatchFormat::Xls);
    }

    #[test]
    fn zip_containers_are_told_apart() {
        let ods = zip_with(&[("mimetype", ODS_MIMETYPE), ("content.xml", "<x/>")]);
        assert_eq!(detect_format(&ods).unwrap(), BatchFormat::Ods);

        let xlsx = zip_with(&[("xl/workbook.xml", "<workbook/>")]);
        assert_eq!(detect_format(&xlsx).unwrap(), BatchFormat::Xlsx);

        let xlsb = zip_with(&[("xl/workbook.bin", "\u{0}")]);
        assert_eq!(detect_format(&xlsb).unwrap(), BatchFormat::Xlsb);
        assert!(BatchFormat::Xlsb.is_spreadsheet());
    }

    #[test]
    fn unrelated_zip_is_rejected() {
        let archive = zip_with(&[("readme.txt", "hello"), ("data/values.csv", "1,2")]);
        assert!(matches!(
            detect_format(&archive),
            Err(SourceError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn other_document_mimetype_is_rejected() {
        let odt = zip_with(&[("mimetype", "application/vnd.oasis.opendocument.text")]);
        assert!(matches!(
            detect_format(&odt),
            Err(SourceError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn openoffice_1_spreadsheet_is_rejected() {
        let sxc = zip_with(&[
            ("mimetype", "application/vnd.sun.xml.calc"),
            ("content.xml", "<office:document-content/>"),
        ]);
        assert!(matches!(
            detect_format(&sxc),
            Err(SourceError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn truncated_zip_is_rejected() {
        assert!(matches!(
            detect_format(&[0x50, 0x4B, 0x03, 0x04, 0x00]),
            Err(SourceError::UnsupportedFormat(_))
        ));
    }
}
