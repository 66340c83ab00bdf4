//! Job-type → checker dispatch.
//!
//! The scheduler never branches on job type itself; everything type-specific
//! (argument policy, reference extraction, output columns) comes from the
//! registered checker.

use std::collections::HashMap;

use super::error::SubmissionError;
use super::traits::{ArgumentPolicy, Checker};
use super::types::JobType;

/// Column appended after the input columns of every result artifact.
pub const MESSAGES_COLUMN: &str = "Errors and warnings";

#[derive(Default)]
pub struct CheckerRegistry {
    checkers: HashMap<JobType, Box<dyn Checker>>,
}

impl CheckerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a checker under its own job type, replacing any previous one.
    pub fn register(&mut self, checker: Box<dyn Checker>) -> &mut Self {
        self.checkers.insert(checker.job_type(), checker);
        self
    }

    pub fn with(mut self, checker: Box<dyn Checker>) -> Self {
        self.register(checker);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<&dyn Checker> {
        self.checkers.get(&job_type).map(|c| c.as_ref())
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.checkers.contains_key(&job_type)
    }

    /// Job types this registry can run, in tag order.
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.checkers.keys().copied().collect();
        types.sort_unstable_by_key(|t| t.as_str());
        types
    }

    /// Resolve a job-type tag to a registered job type.
    pub fn resolve(&self, tag: &str) -> Result<JobType, SubmissionError> {
        let job_type: JobType = tag
            .parse()
            .map_err(|_| SubmissionError::UnknownJobType(tag.to_string()))?;
        if !self.contains(job_type) {
            return Err(SubmissionError::NotRegistered(job_type));
        }
        Ok(job_type)
    }

    /// Apply the checker's argument policy. Returns the argument to store.
    pub fn validate_argument(
        &self,
        job_type: JobType,
        argument: Option<&str>,
    ) -> Result<Option<String>, SubmissionError> {
        let checker = self
            .get(job_type)
            .ok_or(SubmissionError::NotRegistered(job_type))?;
        let argument = argument.map(str::trim).filter(|a| !a.is_empty());

        match checker.argument_policy() {
            ArgumentPolicy::Required => argument
                .map(|a| Some(a.to_string()))
                .ok_or(SubmissionError::MissingArgument(job_type)),
            ArgumentPolicy::Optional => Ok(argument.map(str::to_string)),
            ArgumentPolicy::Ignored => Ok(None),
        }
    }

    /// Header line of a result artifact: input columns, the messages column,
    /// then the checker's output columns.
    pub fn output_header(
        &self,
        job_type: JobType,
        input_columns: &[String],
    ) -> Result<Vec<String>, SubmissionError> {
        let checker = self
            .get(job_type)
            .ok_or(SubmissionError::NotRegistered(job_type))?;
        let mut header = input_columns.to_vec();
        header.push(MESSAGES_COLUMN.to_string());
        header.extend(checker.column_names());
        Ok(header)
    }
}

impl std::fmt::Debug for CheckerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.checkers.keys().map(|t| t.as_str()).collect();
        types.sort_unstable();
        f.debug_struct("CheckerRegistry")
            .field("job_types", &types)
            .finish()
    }
}
