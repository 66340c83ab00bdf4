//! Row screening done before any cascade or checker work.
//!
//! Submission never validates rows; a row that cannot be an entry is answered
//! here with a scheduler message and the checker is not called.

use super::types::CheckOutcome;

pub const SCHEDULER_PREFIX: &str = "(Scheduler): ";

/// Characters of a malformed row echoed back in its first output field.
const ECHO_LENGTH: usize = 180;

/// Outcome of screening one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screening {
    /// The row is a single entry and goes on to the cascade and the checker.
    Entry,
    /// The row is answered without a checker call.
    Rejected {
        /// Replacement for the first output field, if the raw line is unfit.
        first_field: Option<String>,
        outcome: CheckOutcome,
    },
}

/// Build a scheduler-originated message.
pub fn scheduler_message(text: impl AsRef<str>) -> String {
    format!("{SCHEDULER_PREFIX}{}", text.as_ref())
}

/// Screen a queued line. `max_length` is counted in characters.
pub fn screen(line: &str, max_length: usize) -> Screening {
    if line.trim().is_empty() {
        return Screening::Rejected {
            first_field: None,
            outcome: CheckOutcome::failed(vec![scheduler_message("Empty Line")]),
        };
    }

    if line.contains('\t') || line.chars().count() > max_length {
        return Screening::Rejected {
            first_field: Some(format!("InputFields: {}", echo(line))),
            outcome: CheckOutcome::failed(vec![scheduler_message(
                "Entry could not be formatted correctly, check batch input file help for details",
            )]),
        };
    }

    Screening::Entry
}

fn echo(line: &str) -> String {
    let shown: String = line
        .chars()
        .take(ECHO_LENGTH)
        .map(|c| if c == '\t' { '|' } else { c })
        .collect();
    if line.chars().count() > ECHO_LENGTH {
        format!("{shown}...")
    } else {
        shown
    }
}
