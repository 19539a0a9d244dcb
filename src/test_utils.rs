//! In-memory record store and classifier fixtures shared by unit tests.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::bayes::NaiveBayesModel;
use crate::error::{EvaluationError, Result};
use crate::models::{
    Answer, Comment, CompletedSubmission, GroupClass, NewSurvey, RegistryCounts, Role, Sentiment,
    Subject, Survey, SurveyFilter, SurveyStatus, User,
};
use crate::sentiment::{ModelError, ModelLoader, SentimentClassifier, SentimentModel};
use crate::store::RecordStore;

/// Write step at which the next atomic operation should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    InsertComment,
    InsertAnswers,
    UpdateStatus,
    Commit,
}

#[derive(Debug, Default, Clone)]
struct Tables {
    next_id: i64,
    users: Vec<User>,
    subjects: Vec<Subject>,
    groups: Vec<GroupClass>,
    surveys: Vec<Survey>,
    comments: Vec<Comment>,
    answers: Vec<Answer>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_at: Mutex<Option<FailPoint>>,
}

fn filter_matches(filter: SurveyFilter, survey: &Survey) -> bool {
    match filter {
        SurveyFilter::Student(student_id) => survey.student_id == student_id,
        SurveyFilter::Professor {
            professor_id,
            subject_id,
        } => {
            survey.professor_id == professor_id
                && subject_id.map_or(true, |id| survey.subject_id == id)
        }
        SurveyFilter::All => true,
    }
}

fn injected(step: FailPoint) -> EvaluationError {
    EvaluationError::Storage(format!("injected failure at {step:?}"))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_at(&self, step: FailPoint) {
        *self.fail_at.lock().unwrap() = Some(step);
    }

    fn check(&self, step: FailPoint) -> Result<()> {
        let mut fail_at = self.fail_at.lock().unwrap();
        if *fail_at == Some(step) {
            *fail_at = None;
            return Err(injected(step));
        }
        Ok(())
    }

    pub fn add_user(&self, first_name: &str, last_name: &str, role: Role) -> i64 {
        let mut tables = self.tables.lock().unwrap();
        let id = tables.next_id();
        tables.users.push(User {
            id,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            role,
        });
        id
    }

    pub fn add_subject(&self, code: &str, name: &str, professor_id: i64) -> i64 {
        let mut tables = self.tables.lock().unwrap();
        let id = tables.next_id();
        tables.subjects.push(Subject {
            id,
            code: code.to_string(),
            name: name.to_string(),
            professor_id: Some(professor_id),
            semester: Some(5),
            is_active: true,
        });
        id
    }

    pub fn add_group(&self, subject_id: i64, professor_id: i64, name: &str, students: i32) -> i64 {
        let mut tables = self.tables.lock().unwrap();
        let id = tables.next_id();
        tables.groups.push(GroupClass {
            id,
            subject_id,
            professor_id,
            group_name: name.to_string(),
            semester_period: Some("2026-1".to_string()),
            current_students: students,
        });
        id
    }

    pub fn add_survey(&self, student_id: i64, professor_id: i64, subject_id: i64) -> i64 {
        let mut tables = self.tables.lock().unwrap();
        let id = tables.next_id();
        tables.surveys.push(Survey {
            id,
            student_id,
            professor_id,
            subject_id,
            status: SurveyStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        });
        id
    }

    /// Insert an already-completed survey with its comment.
    pub fn add_completed(
        &self,
        student_id: i64,
        professor_id: i64,
        subject_id: i64,
        sentiment: Sentiment,
        completed_at: DateTime<Utc>,
    ) -> i64 {
        let id = self.add_survey(student_id, professor_id, subject_id);
        let mut tables = self.tables.lock().unwrap();
        let comment_id = tables.next_id();
        if let Some(survey) = tables.surveys.iter_mut().find(|s| s.id == id) {
            survey.status = SurveyStatus::Completed;
            survey.completed_at = Some(completed_at);
        }
        tables.comments.push(Comment {
            id: comment_id,
            survey_id: id,
            text: format!("comentario {sentiment} de la encuesta {id}"),
            sentiment,
            confidence_score: 0.9,
            created_at: completed_at,
        });
        id
    }

    pub fn set_status(&self, survey_id: i64, status: SurveyStatus) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(survey) = tables.surveys.iter_mut().find(|s| s.id == survey_id) {
            survey.status = status;
        }
    }

    pub fn survey(&self, survey_id: i64) -> Option<Survey> {
        let tables = self.tables.lock().unwrap();
        tables.surveys.iter().find(|s| s.id == survey_id).cloned()
    }

    pub fn comments_for(&self, survey_id: i64) -> Vec<Comment> {
        let tables = self.tables.lock().unwrap();
        tables
            .comments
            .iter()
            .filter(|c| c.survey_id == survey_id)
            .cloned()
            .collect()
    }

    pub fn answer_count(&self, survey_id: i64) -> usize {
        let tables = self.tables.lock().unwrap();
        tables.answers.iter().filter(|a| a.survey_id == survey_id).count()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn fetch_survey(&self, id: i64) -> Result<Option<Survey>> {
        Ok(self.survey(id))
    }

    async fn fetch_surveys(&self, filter: SurveyFilter) -> Result<Vec<Survey>> {
        let tables = self.tables.lock().unwrap();
        let mut surveys: Vec<Survey> = tables
            .surveys
            .iter()
            .filter(|s| filter_matches(filter, s))
            .cloned()
            .collect();
        surveys.sort_by_key(|s| s.id);
        Ok(surveys)
    }

    async fn fetch_comments(&self, survey_ids: &[i64]) -> Result<Vec<Comment>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .comments
            .iter()
            .filter(|c| survey_ids.contains(&c.survey_id))
            .cloned()
            .collect())
    }

    async fn fetch_answers(&self, survey_id: i64) -> Result<Vec<Answer>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .answers
            .iter()
            .filter(|a| a.survey_id == survey_id)
            .cloned()
            .collect())
    }

    async fn complete_survey(&self, submission: &CompletedSubmission) -> Result<(Survey, Comment)> {
        let mut tables = self.tables.lock().unwrap();

        let status = tables
            .surveys
            .iter()
            .find(|s| s.id == submission.survey_id)
            .map(|s| s.status)
            .ok_or_else(|| EvaluationError::NotFound(format!("Survey {}", submission.survey_id)))?;
        if status != SurveyStatus::Pending {
            return Err(EvaluationError::InvalidState(status));
        }

        // Work on a copy and publish it only when every step succeeded.
        let mut staged = tables.clone();

        self.check(FailPoint::InsertComment)?;
        let comment = Comment {
            id: staged.next_id(),
            survey_id: submission.survey_id,
            text: submission.comment_text.clone(),
            sentiment: submission.sentiment,
            confidence_score: submission.confidence_score,
            created_at: submission.completed_at,
        };
        staged.comments.push(comment.clone());

        self.check(FailPoint::InsertAnswers)?;
        for (question_id, rating) in &submission.answers {
            staged.answers.push(Answer {
                survey_id: submission.survey_id,
                question_id: question_id.clone(),
                rating: *rating,
            });
        }

        self.check(FailPoint::UpdateStatus)?;
        let survey = staged
            .surveys
            .iter_mut()
            .find(|s| s.id == submission.survey_id)
            .ok_or_else(|| EvaluationError::Storage("survey vanished".to_string()))?;
        survey.status = SurveyStatus::Completed;
        survey.completed_at = Some(submission.completed_at);
        let survey = survey.clone();

        self.check(FailPoint::Commit)?;
        *tables = staged;
        Ok((survey, comment))
    }

    async fn cancel_survey(&self, id: i64) -> Result<Survey> {
        let mut tables = self.tables.lock().unwrap();
        let survey = tables
            .surveys
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| EvaluationError::NotFound(format!("Survey {id}")))?;
        if survey.status != SurveyStatus::Pending {
            return Err(EvaluationError::NotCancelable(survey.status));
        }
        survey.status = SurveyStatus::Canceled;
        Ok(survey.clone())
    }

    async fn create_survey(&self, new: &NewSurvey, created_at: DateTime<Utc>) -> Result<Survey> {
        let mut tables = self.tables.lock().unwrap();
        let duplicate = tables.surveys.iter().any(|s| {
            s.student_id == new.student_id
                && s.professor_id == new.professor_id
                && s.subject_id == new.subject_id
        });
        if duplicate {
            return Err(EvaluationError::Conflict(format!(
                "student {} already evaluates professor {} for subject {}",
                new.student_id, new.professor_id, new.subject_id
            )));
        }

        let survey = Survey {
            id: tables.next_id(),
            student_id: new.student_id,
            professor_id: new.professor_id,
            subject_id: new.subject_id,
            status: SurveyStatus::Pending,
            created_at,
            completed_at: None,
        };
        tables.surveys.push(survey.clone());
        Ok(survey)
    }

    async fn fetch_user(&self, id: i64) -> Result<Option<User>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.users.iter().find(|u| u.id == id).cloned())
    }

    async fn fetch_subject(&self, id: i64) -> Result<Option<Subject>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.subjects.iter().find(|s| s.id == id).cloned())
    }

    async fn subjects_for_professor(&self, professor_id: i64) -> Result<Vec<Subject>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .subjects
            .iter()
            .filter(|s| s.professor_id == Some(professor_id) && s.is_active)
            .cloned()
            .collect())
    }

    async fn groups_for_professor(&self, professor_id: i64) -> Result<Vec<GroupClass>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .groups
            .iter()
            .filter(|g| g.professor_id == professor_id)
            .cloned()
            .collect())
    }

    async fn registry_counts(&self) -> Result<RegistryCounts> {
        let tables = self.tables.lock().unwrap();
        let users_with = |role: Role| tables.users.iter().filter(|u| u.role == role).count() as i64;
        Ok(RegistryCounts {
            total_students: users_with(Role::Student),
            total_professors: users_with(Role::Professor),
            total_admins: users_with(Role::Admin),
            total_subjects: tables.subjects.len() as i64,
            total_groups: tables.groups.len() as i64,
        })
    }
}

struct Preloaded(NaiveBayesModel);

impl ModelLoader for Preloaded {
    fn load(&self) -> std::result::Result<Box<dyn SentimentModel>, ModelError> {
        Ok(Box::new(self.0.clone()))
    }
}

struct Missing;

impl ModelLoader for Missing {
    fn load(&self) -> std::result::Result<Box<dyn SentimentModel>, ModelError> {
        Err(ModelError::Unavailable("final_model not found".to_string()))
    }
}

/// Classifier backed by a model fitted on a small Spanish corpus.
pub fn trained_classifier() -> SentimentClassifier {
    let model = NaiveBayesModel::fit(&crate::bayes::tests::corpus()).unwrap();
    SentimentClassifier::new(Preloaded(model))
}

/// Classifier whose model can never be loaded.
pub fn unavailable_classifier() -> SentimentClassifier {
    SentimentClassifier::new(Missing)
}
