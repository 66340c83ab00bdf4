//! Reference identifiers at the start of a batch entry.
//!
//! Checkers that retrieve reference sequences declare which identifier an
//! entry depends on; the scheduler keys its skip set and substitution map
//! on the base (unversioned) form.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

/// `NM_000059.3:c.…`, `AL449423.14(CDKN2A_v002):c.…`, `chr11:g.…`
static REFERENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z][A-Za-z0-9_]*)(?:\.(\d+))?[:(]").unwrap()
});

/// The identifier an entry refers to, with its location in the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceId {
    /// Accession without version, e.g. `NM_000059`.
    pub base: String,
    /// Version digits as written, e.g. `3`. Kept as text so any version,
    /// however long, marks the identifier as versioned.
    pub version: Option<String>,
    /// Byte range of the full identifier (base plus version) in the entry.
    pub span: Range<usize>,
}

impl ReferenceId {
    /// True when the entry names no version, so a resolved form may be substituted.
    pub fn is_bare(&self) -> bool {
        self.version.is_none()
    }

    /// Replace the identifier in `entry` with `replacement`.
    pub fn rewrite(&self, entry: &str, replacement: &str) -> String {
        let mut rewritten = String::with_capacity(entry.len() + replacement.len());
        rewritten.push_str(&entry[..self.span.start]);
        rewritten.push_str(replacement);
        rewritten.push_str(&entry[self.span.end..]);
        rewritten
    }
}

/// Parse the reference identifier at the start of a variant description.
pub fn parse_reference(entry: &str) -> Option<ReferenceId> {
    let caps = REFERENCE_PATTERN.captures(entry)?;
    let base = caps.get(1)?;
    let version = caps.get(2);
    let end = version.map_or(base.end(), |v| v.end());
    Some(ReferenceId {
        base: base.as_str().to_string(),
        version: version.map(|v| v.as_str().to_string()),
        span: base.start()..end,
    })
}
