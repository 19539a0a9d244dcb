//! Error types for survey submission, provisioning and reporting.

use thiserror::Error;

use crate::models::SurveyStatus;

#[derive(Error, Debug)]
pub enum EvaluationError {
    /// A survey, subject or professor id did not resolve
    #[error("{0} not found")]
    NotFound(String),

    /// The caller does not own the record
    #[error("Access denied - {0}")]
    Forbidden(String),

    /// The survey is no longer pending
    #[error("{}", invalid_state_message(.0))]
    InvalidState(SurveyStatus),

    /// Cancellation of a survey that already left `pending`
    #[error("{}", not_cancelable_message(.0))]
    NotCancelable(SurveyStatus),

    /// Input rejected before any classification or persistence
    #[error("{0}")]
    Validation(String),

    /// A survey with the same student, professor and subject already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, EvaluationError>;

fn invalid_state_message(status: &SurveyStatus) -> &'static str {
    match status {
        SurveyStatus::Completed => "Survey already completed",
        SurveyStatus::Canceled => "Cannot submit a canceled survey",
        SurveyStatus::Pending => "Survey is still pending",
    }
}

fn not_cancelable_message(status: &SurveyStatus) -> &'static str {
    match status {
        SurveyStatus::Canceled => "Survey already canceled",
        SurveyStatus::Completed => "Cannot cancel a completed survey",
        SurveyStatus::Pending => "Survey is still pending",
    }
}

impl EvaluationError {
    /// Message safe to show to the end user. Storage failures are reported
    /// generically; their detail belongs in the log.
    pub fn user_message(&self) -> String {
        match self {
            EvaluationError::Database(_) | EvaluationError::Storage(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            EvaluationError::Database(_) | EvaluationError::Storage(_)
        )
    }
}
