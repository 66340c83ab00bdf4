//! Plain-text batch files: one entry per line, fields separated by TAB.
//!
//! UTF-8 is tried first (a byte-order mark is dropped); anything that is not
//! valid UTF-8 is decoded as Windows-1252, which maps every byte. Since that
//! fallback accepts anything, binary content is rejected on the raw bytes
//! before decoding.

use encoding_rs::WINDOWS_1252;

use super::SourceError;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Share of C0 control bytes (other than TAB, CR, LF) a text file may hold.
const MAX_CONTROL_RATIO: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Windows1252,
}

/// Decode a text upload, rejecting content that does not look like text.
pub fn decode(bytes: &[u8]) -> Result<(String, TextEncoding), SourceError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    if looks_binary(bytes) {
        return Err(not_text());
    }

    let (text, encoding) = match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), TextEncoding::Utf8),
        Err(_) => {
            let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
            (text.into_owned(), TextEncoding::Windows1252)
        }
    };

    if !is_likely_text(&text) {
        return Err(not_text());
    }
    Ok((text, encoding))
}

fn not_text() -> SourceError {
    SourceError::UnsupportedFormat("file is neither text nor a known spreadsheet".into())
}

/// Any NUL byte, or more than a few other C0 control bytes.
fn looks_binary(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    if bytes.contains(&0) {
        return true;
    }
    let controls = bytes
        .iter()
        .filter(|&&b| b < 0x20 && !matches!(b, b'\t' | b'\r' | b'\n'))
        .count();
    controls as f64 / bytes.len() as f64 > MAX_CONTROL_RATIO
}

/// More than 80% printable characters (whitespace counts as printable).
fn is_likely_text(text: &str) -> bool {
    let total = text.chars().count();
    if total == 0 {
        return true;
    }
    let printable = text
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .count();
    printable as f64 / total as f64 > 0.80
}

/// Split decoded text into rows of TAB-separated cells.
pub fn split_rows(text: &str) -> Vec<Vec<String>> {
    text.lines()
        .map(|line| line.split('\t').map(str::to_string).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_with_bom() {
        let (text, encoding) = decode(b"\xEF\xBB\xBFNM_003002.2:c.274G>T\n").unwrap();
        assert_eq!(text, "NM_003002.2:c.274G>T\n");
        assert_eq!(encoding, TextEncoding::Utf8);
    }

    #[test]
    fn invalid_utf8_falls_back_to_windows_1252() {
        let (text, encoding) = decode(b"NM_003002.2:c.274G>T caf\xE9\n").unwrap();
        assert_eq!(text, "NM_003002.2:c.274G>T caf\u{e9}\n");
        assert_eq!(encoding, TextEncoding::Windows1252);
    }

    #[test]
    fn binary_content_is_rejected() {
        let bytes: Vec<u8> = (0u8..32).cycle().take(256).collect();
        assert!(matches!(
            decode(&bytes),
            Err(SourceError::UnsupportedFormat(_))
        ));
    }

    /// Linear congruential bytes, deterministic across runs.
    fn noise(len: usize) -> Vec<u8> {
        let mut state: u32 = 0x2545_F491;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect()
    }

    #[test]
    fn binary_container_is_rejected_before_the_1252_fallback() {
        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        png.extend(noise(4096));
        assert!(matches!(decode(&png), Err(SourceError::UnsupportedFormat(_))));

        let mut gzip = vec![0x1F, 0x8B, 0x08, 0x00];
        gzip.extend(noise(512));
        assert!(matches!(decode(&gzip), Err(SourceError::UnsupportedFormat(_))));
    }

    #[test]
    fn single_nul_byte_is_binary() {
        assert!(decode(b"NM_003002.2:c.274G>T\0\n").is_err());
    }

    #[test]
    fn stray_control_byte_in_long_text_is_tolerated() {
        let mut text = "NM_003002.2:c.274G>T\n".repeat(20).into_bytes();
        text.push(0x1B);
        assert!(decode(&text).is_ok());
    }

    #[test]
    fn rows_split_on_tabs_and_line_endings() {
        let rows = split_rows("a\tb\r\n\nc\n");
        assert_eq!(
            rows,
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["".to_string()],
                vec!["c".to_string()],
            ]
        );
    }
}
