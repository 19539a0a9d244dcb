//! Survey lifecycle: submission, cancellation, and provisioning.
//!
//! A survey starts `pending` and moves exactly once, either to `completed`
//! through [`SurveyService::submit`] or to `canceled` through
//! [`SurveyService::cancel`]. Both transitions are compare-and-set in the
//! record store, so racing callers see at most one success.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{EvaluationError, Result};
use crate::models::{
    Answer, Comment, CompletedSubmission, NewSurvey, Sentiment, Survey, SurveyFilter, SurveyStatus,
};
use crate::sentiment::SentimentClassifier;
use crate::store::RecordStore;

pub const MIN_COMMENT_CHARS: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionOutcome {
    pub survey_id: i64,
    pub status: SurveyStatus,
    pub sentiment: Sentiment,
    pub confidence: f64,
    /// True when the classifier was unavailable and the neutral default was used.
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentSurvey {
    pub survey: Survey,
    pub professor_name: String,
    pub subject_name: String,
    pub subject_code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectToEvaluate {
    pub subject_id: i64,
    pub name: String,
    pub code: String,
    pub survey_id: i64,
    pub survey_status: SurveyStatus,
}

/// A professor the student evaluates, with one entry per shared subject.
#[derive(Debug, Clone, Serialize)]
pub struct ProfessorToEvaluate {
    pub professor_id: i64,
    pub name: String,
    pub subjects: Vec<SubjectToEvaluate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SurveyDetail {
    pub survey: Survey,
    pub comment: Option<Comment>,
    pub answers: Vec<Answer>,
}

pub struct SurveyService {
    store: Arc<dyn RecordStore>,
    classifier: Arc<SentimentClassifier>,
}

impl SurveyService {
    pub fn new(store: Arc<dyn RecordStore>, classifier: Arc<SentimentClassifier>) -> Self {
        Self { store, classifier }
    }

    /// Load a survey and check that `student_id` owns it.
    async fn owned_survey(&self, survey_id: i64, student_id: i64) -> Result<Survey> {
        let survey = self
            .store
            .fetch_survey(survey_id)
            .await?
            .ok_or_else(|| EvaluationError::NotFound(format!("Survey {survey_id}")))?;

        if survey.student_id != student_id {
            return Err(EvaluationError::Forbidden("Not your survey".to_string()));
        }
        Ok(survey)
    }

    pub async fn submit(
        &self,
        survey_id: i64,
        student_id: i64,
        answers: &BTreeMap<String, i32>,
        comment: &str,
    ) -> Result<SubmissionOutcome> {
        let survey = self.owned_survey(survey_id, student_id).await?;
        if survey.status != SurveyStatus::Pending {
            return Err(EvaluationError::InvalidState(survey.status));
        }

        if answers.is_empty() {
            return Err(EvaluationError::Validation("No answers provided".to_string()));
        }
        let comment_text = comment.trim();
        if comment_text.chars().count() < MIN_COMMENT_CHARS {
            return Err(EvaluationError::Validation(format!(
                "Comment must be at least {MIN_COMMENT_CHARS} characters"
            )));
        }

        let classification = self.classifier.classify(comment_text);
        let submission = CompletedSubmission {
            survey_id,
            comment_text: comment_text.to_string(),
            sentiment: classification.sentiment(),
            confidence_score: classification.confidence(),
            answers: answers.clone(),
            completed_at: Utc::now(),
        };

        let (survey, comment) = self
            .store
            .complete_survey(&submission)
            .await
            .inspect_err(|err| {
                if err.is_internal() {
                    error!(survey_id, error = %err, "survey submission rolled back");
                }
            })?;

        info!(
            survey_id,
            student_id,
            sentiment = %comment.sentiment,
            confidence = comment.confidence_score,
            degraded = classification.is_degraded(),
            "survey submitted"
        );

        Ok(SubmissionOutcome {
            survey_id: survey.id,
            status: survey.status,
            sentiment: comment.sentiment,
            confidence: comment.confidence_score,
            degraded: classification.is_degraded(),
        })
    }

    /// Cancel a pending survey. Triggered by administrators, not students.
    pub async fn cancel(&self, survey_id: i64) -> Result<Survey> {
        let survey = self.store.cancel_survey(survey_id).await?;
        info!(survey_id, "survey canceled");
        Ok(survey)
    }

    /// The student's surveys with professor and subject names. Surveys whose
    /// professor or subject no longer resolves are skipped.
    pub async fn surveys_for_student(&self, student_id: i64) -> Result<Vec<StudentSurvey>> {
        let surveys = self
            .store
            .fetch_surveys(SurveyFilter::Student(student_id))
            .await?;
        let mut listed = Vec::new();

        for survey in surveys {
            let Some(professor) = self.store.fetch_user(survey.professor_id).await? else {
                continue;
            };
            let Some(subject) = self.store.fetch_subject(survey.subject_id).await? else {
                continue;
            };
            listed.push(StudentSurvey {
                survey,
                professor_name: professor.full_name(),
                subject_name: subject.name,
                subject_code: subject.code,
            });
        }

        Ok(listed)
    }

    /// The student's surveys grouped by professor, in first-seen order.
    pub async fn professors_for_student(
        &self,
        student_id: i64,
    ) -> Result<Vec<ProfessorToEvaluate>> {
        let surveys = self
            .store
            .fetch_surveys(SurveyFilter::Student(student_id))
            .await?;
        let mut professors: Vec<ProfessorToEvaluate> = Vec::new();

        for survey in surveys {
            let Some(professor) = self.store.fetch_user(survey.professor_id).await? else {
                continue;
            };
            let Some(subject) = self.store.fetch_subject(survey.subject_id).await? else {
                continue;
            };

            let entry = SubjectToEvaluate {
                subject_id: subject.id,
                name: subject.name,
                code: subject.code,
                survey_id: survey.id,
                survey_status: survey.status,
            };
            match professors.iter_mut().find(|p| p.professor_id == professor.id) {
                Some(existing) => existing.subjects.push(entry),
                None => professors.push(ProfessorToEvaluate {
                    professor_id: professor.id,
                    name: professor.full_name(),
                    subjects: vec![entry],
                }),
            }
        }

        Ok(professors)
    }

    pub async fn survey_detail(&self, survey_id: i64, student_id: i64) -> Result<SurveyDetail> {
        let survey = self.owned_survey(survey_id, student_id).await?;

        let (comment, answers) = if survey.status == SurveyStatus::Completed {
            let comment = self.store.fetch_comments(&[survey.id]).await?.into_iter().next();
            let answers = self.store.fetch_answers(survey.id).await?;
            (comment, answers)
        } else {
            (None, Vec::new())
        };

        Ok(SurveyDetail {
            survey,
            comment,
            answers,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProvisionSummary {
    pub created: usize,
    pub duplicates: usize,
}

/// Create pending surveys from CSV rows of `student_id,professor_id,subject_id`.
/// Rows that would duplicate an existing survey are counted and skipped.
pub async fn provision_from_reader<R: Read>(
    store: &dyn RecordStore,
    input: R,
) -> anyhow::Result<ProvisionSummary> {
    #[derive(Deserialize)]
    struct CsvRow {
        student_id: i64,
        professor_id: i64,
        subject_id: i64,
    }

    let mut reader = csv::Reader::from_reader(input);
    let mut summary = ProvisionSummary::default();

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let new = NewSurvey {
            student_id: row.student_id,
            professor_id: row.professor_id,
            subject_id: row.subject_id,
        };

        match store.create_survey(&new, Utc::now()).await {
            Ok(_) => summary.created += 1,
            Err(EvaluationError::Conflict(reason)) => {
                warn!(%reason, "skipping duplicate survey");
                summary.duplicates += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(summary)
}

pub async fn provision_from_csv(
    store: &dyn RecordStore,
    csv_path: &Path,
) -> anyhow::Result<ProvisionSummary> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    provision_from_reader(store, file).await
}
