//! Record store contract used by the survey workflow and the aggregation
//! engine. The Postgres implementation lives in `db.rs`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    Answer, Comment, CompletedSubmission, GroupClass, NewSurvey, RegistryCounts, Subject, Survey,
    SurveyFilter, User,
};

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn fetch_survey(&self, id: i64) -> Result<Option<Survey>>;

    /// Surveys matching `filter`, ordered by id.
    async fn fetch_surveys(&self, filter: SurveyFilter) -> Result<Vec<Survey>>;

    async fn fetch_comments(&self, survey_ids: &[i64]) -> Result<Vec<Comment>>;

    async fn fetch_answers(&self, survey_id: i64) -> Result<Vec<Answer>>;

    /// Atomically move a pending survey to completed, writing its comment
    /// and answers. Fails with `InvalidState` if the survey is no longer
    /// pending when the row is locked; nothing is written in that case or
    /// on any storage error.
    async fn complete_survey(&self, submission: &CompletedSubmission) -> Result<(Survey, Comment)>;

    /// Atomically move a pending survey to canceled. Fails with
    /// `NotCancelable` if it already left pending.
    async fn cancel_survey(&self, id: i64) -> Result<Survey>;

    /// Provision a pending survey. A duplicate (student, professor, subject)
    /// triple fails with `Conflict`.
    async fn create_survey(&self, survey: &NewSurvey, created_at: DateTime<Utc>) -> Result<Survey>;

    async fn fetch_user(&self, id: i64) -> Result<Option<User>>;

    async fn fetch_subject(&self, id: i64) -> Result<Option<Subject>>;

    /// Active subjects taught by the professor.
    async fn subjects_for_professor(&self, professor_id: i64) -> Result<Vec<Subject>>;

    /// Active groups taught by the professor.
    async fn groups_for_professor(&self, professor_id: i64) -> Result<Vec<GroupClass>>;

    /// Users per role plus subject and group totals, inactive rows included.
    async fn registry_counts(&self) -> Result<RegistryCounts>;
}
