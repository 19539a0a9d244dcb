//! Sentiment aggregation over completed surveys.
//!
//! Every figure is recomputed from the current comments on each call; there
//! are no stored counters to drift out of date.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{EvaluationError, Result};
use crate::models::{
    Comment, GroupClass, RegistryCounts, Role, Sentiment, Subject, Survey, SurveyFilter,
    SurveyStatus,
};
use crate::store::RecordStore;

pub const RECENT_COMMENT_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Professor(i64),
    Subject { professor_id: i64, subject_id: i64 },
    Institution,
}

impl Scope {
    fn filter(self) -> SurveyFilter {
        match self {
            Scope::Professor(professor_id) => SurveyFilter::Professor {
                professor_id,
                subject_id: None,
            },
            Scope::Subject {
                professor_id,
                subject_id,
            } => SurveyFilter::Professor {
                professor_id,
                subject_id: Some(subject_id),
            },
            Scope::Institution => SurveyFilter::All,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SentimentCounts {
    pub positive: usize,
    pub neutral: usize,
    pub negative: usize,
}

impl SentimentCounts {
    pub fn record(&mut self, sentiment: Sentiment) {
        match sentiment {
            Sentiment::Positive => self.positive += 1,
            Sentiment::Neutral => self.neutral += 1,
            Sentiment::Negative => self.negative += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.positive + self.neutral + self.negative
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SentimentSummary {
    #[serde(flatten)]
    pub counts: SentimentCounts,
    pub total: usize,
    pub satisfaction_rate: f64,
}

impl From<SentimentCounts> for SentimentSummary {
    fn from(counts: SentimentCounts) -> Self {
        let total = counts.total();
        Self {
            counts,
            total,
            satisfaction_rate: satisfaction_rate(counts.positive, total),
        }
    }
}

/// Percentage of positive comments, rounded to one decimal. Zero when there
/// are no comments.
pub fn satisfaction_rate(positive: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let rate = positive as f64 / total as f64 * 100.0;
    (rate * 10.0).round() / 10.0
}

pub fn tally<'a>(comments: impl IntoIterator<Item = &'a Comment>) -> SentimentCounts {
    let mut counts = SentimentCounts::default();
    for comment in comments {
        counts.record(comment.sentiment);
    }
    counts
}

async fn ensure_scope(store: &dyn RecordStore, scope: Scope) -> Result<()> {
    match scope {
        Scope::Professor(professor_id) => {
            ensure_professor(store, professor_id).await.map(|_| ())
        }
        Scope::Subject { subject_id, .. } => {
            store
                .fetch_subject(subject_id)
                .await?
                .ok_or_else(|| EvaluationError::NotFound(format!("Subject {subject_id}")))?;
            Ok(())
        }
        Scope::Institution => Ok(()),
    }
}

async fn ensure_professor(store: &dyn RecordStore, professor_id: i64) -> Result<String> {
    match store.fetch_user(professor_id).await? {
        Some(user) if user.role == Role::Professor => Ok(user.full_name()),
        _ => Err(EvaluationError::NotFound(format!("Professor {professor_id}"))),
    }
}

async fn completed_surveys(store: &dyn RecordStore, scope: Scope) -> Result<Vec<Survey>> {
    let surveys = store.fetch_surveys(scope.filter()).await?;
    Ok(surveys
        .into_iter()
        .filter(|survey| survey.status == SurveyStatus::Completed)
        .collect())
}

async fn comments_of(store: &dyn RecordStore, surveys: &[Survey]) -> Result<Vec<Comment>> {
    let ids: Vec<i64> = surveys.iter().map(|survey| survey.id).collect();
    store.fetch_comments(&ids).await
}

pub async fn aggregate(store: &dyn RecordStore, scope: Scope) -> Result<SentimentSummary> {
    ensure_scope(store, scope).await?;
    let surveys = completed_surveys(store, scope).await?;
    let comments = comments_of(store, &surveys).await?;
    Ok(tally(&comments).into())
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentComment {
    pub survey_id: i64,
    pub text: String,
    pub sentiment: Sentiment,
    pub subject: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub days_ago: i64,
}

/// Comments of the most recently completed surveys, newest first. Surveys
/// completed at the same instant keep their id order.
pub async fn recent_comments(
    store: &dyn RecordStore,
    scope: Scope,
    limit: usize,
    now: DateTime<Utc>,
) -> Result<Vec<RecentComment>> {
    ensure_scope(store, scope).await?;
    let mut surveys = completed_surveys(store, scope).await?;
    surveys.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
    surveys.truncate(limit);

    let comments: HashMap<i64, Comment> = comments_of(store, &surveys)
        .await?
        .into_iter()
        .map(|comment| (comment.survey_id, comment))
        .collect();
    let mut subject_names: HashMap<i64, String> = HashMap::new();
    let mut recent = Vec::new();

    for survey in surveys {
        let Some(comment) = comments.get(&survey.id) else {
            continue;
        };

        if !subject_names.contains_key(&survey.subject_id) {
            let name = store
                .fetch_subject(survey.subject_id)
                .await?
                .map(|subject| subject.name)
                .unwrap_or_else(|| "Unknown".to_string());
            subject_names.insert(survey.subject_id, name);
        }

        recent.push(RecentComment {
            survey_id: survey.id,
            text: comment.text.clone(),
            sentiment: comment.sentiment,
            subject: subject_names[&survey.subject_id].clone(),
            completed_at: survey.completed_at,
            days_ago: (now - comment.created_at).num_days().max(0),
        });
    }

    Ok(recent)
}

#[derive(Debug, Clone, Serialize)]
pub struct InstitutionOverview {
    pub total_surveys: usize,
    pub completed_surveys: usize,
    pub pending_surveys: usize,
    pub canceled_surveys: usize,
    /// Distinct students with at least one completed survey.
    pub students_with_surveys: usize,
    #[serde(flatten)]
    pub registry: RegistryCounts,
    pub sentiment: SentimentSummary,
}

pub async fn institution_overview(store: &dyn RecordStore) -> Result<InstitutionOverview> {
    let surveys = store.fetch_surveys(SurveyFilter::All).await?;

    let count = |status: SurveyStatus| surveys.iter().filter(|s| s.status == status).count();
    let completed: Vec<Survey> = surveys
        .iter()
        .filter(|survey| survey.status == SurveyStatus::Completed)
        .cloned()
        .collect();
    let students: HashSet<i64> = completed.iter().map(|survey| survey.student_id).collect();
    let comments = comments_of(store, &completed).await?;
    let registry = store.registry_counts().await?;

    Ok(InstitutionOverview {
        total_surveys: surveys.len(),
        completed_surveys: completed.len(),
        pending_surveys: count(SurveyStatus::Pending),
        canceled_surveys: count(SurveyStatus::Canceled),
        students_with_surveys: students.len(),
        registry,
        sentiment: tally(&comments).into(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectSummary {
    pub subject: Subject,
    pub sentiment: SentimentSummary,
}

/// Subject-scope summaries for every active subject the professor teaches.
pub async fn subject_breakdown(
    store: &dyn RecordStore,
    professor_id: i64,
) -> Result<Vec<SubjectSummary>> {
    ensure_professor(store, professor_id).await?;
    let mut summaries = Vec::new();

    for subject in store.subjects_for_professor(professor_id).await? {
        let scope = Scope::Subject {
            professor_id,
            subject_id: subject.id,
        };
        let sentiment = aggregate(store, scope).await?;
        summaries.push(SubjectSummary { subject, sentiment });
    }

    Ok(summaries)
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupLoad {
    #[serde(flatten)]
    pub group: GroupClass,
    pub subject: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfessorDashboard {
    pub professor_id: i64,
    pub professor_name: String,
    pub total_subjects: usize,
    pub total_groups: usize,
    pub total_students: i64,
    pub groups: Vec<GroupLoad>,
    pub sentiment: SentimentSummary,
    pub recent_comments: Vec<RecentComment>,
}

pub async fn professor_dashboard(
    store: &dyn RecordStore,
    professor_id: i64,
    now: DateTime<Utc>,
) -> Result<ProfessorDashboard> {
    let professor_name = ensure_professor(store, professor_id).await?;
    let subjects = store.subjects_for_professor(professor_id).await?;
    let groups = store.groups_for_professor(professor_id).await?;
    let scope = Scope::Professor(professor_id);

    let subject_names: HashMap<i64, &str> = subjects
        .iter()
        .map(|subject| (subject.id, subject.name.as_str()))
        .collect();
    let total_students = groups.iter().map(|g| i64::from(g.current_students)).sum();
    let total_groups = groups.len();
    let groups = groups
        .into_iter()
        .map(|group| GroupLoad {
            subject: subject_names
                .get(&group.subject_id)
                .copied()
                .unwrap_or("Unknown")
                .to_string(),
            group,
        })
        .collect();

    Ok(ProfessorDashboard {
        professor_id,
        professor_name,
        total_subjects: subjects.len(),
        total_groups,
        total_students,
        groups,
        sentiment: aggregate(store, scope).await?,
        recent_comments: recent_comments(store, scope, RECENT_COMMENT_LIMIT, now).await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryStore;
    use chrono::{Duration, TimeZone};

    struct Campus {
        store: MemoryStore,
        professor: i64,
        other_professor: i64,
        databases: i64,
        networks: i64,
        students: Vec<i64>,
    }

    fn campus() -> Campus {
        let store = MemoryStore::new();
        let professor = store.add_user("Juan", "Pérez", Role::Professor);
        let other_professor = store.add_user("Laura", "Méndez", Role::Professor);
        let databases = store.add_subject("ICO-305", "Bases de Datos", professor);
        let networks = store.add_subject("ICO-410", "Redes", other_professor);
        let students = (0..6)
            .map(|i| store.add_user(&format!("Alumno{i}"), "Prueba", Role::Student))
            .collect();

        Campus {
            store,
            professor,
            other_professor,
            databases,
            networks,
            students,
        }
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 10, 0, 0).unwrap()
    }

    #[test]
    fn rate_rounds_to_one_decimal() {
        assert_eq!(satisfaction_rate(3, 5), 60.0);
        assert_eq!(satisfaction_rate(2, 3), 66.7);
        assert_eq!(satisfaction_rate(1, 3), 33.3);
        assert_eq!(satisfaction_rate(0, 4), 0.0);
        assert_eq!(satisfaction_rate(4, 4), 100.0);
        assert_eq!(satisfaction_rate(0, 0), 0.0);
    }

    #[tokio::test]
    async fn professor_scope_counts_completed_comments() {
        let c = campus();
        let s = &c.students;
        c.store.add_completed(s[0], c.professor, c.databases, Sentiment::Positive, at(1));
        c.store.add_completed(s[1], c.professor, c.databases, Sentiment::Positive, at(2));
        c.store.add_completed(s[2], c.professor, c.databases, Sentiment::Positive, at(3));
        c.store.add_completed(s[3], c.professor, c.databases, Sentiment::Neutral, at(4));
        c.store.add_completed(s[4], c.professor, c.databases, Sentiment::Negative, at(5));
        // Pending surveys and other professors do not count.
        c.store.add_survey(s[5], c.professor, c.databases);
        c.store.add_completed(s[5], c.other_professor, c.networks, Sentiment::Negative, at(6));

        let summary = aggregate(&c.store, Scope::Professor(c.professor)).await.unwrap();

        assert_eq!(
            summary.counts,
            SentimentCounts {
                positive: 3,
                neutral: 1,
                negative: 1
            }
        );
        assert_eq!(summary.total, 5);
        assert_eq!(summary.satisfaction_rate, 60.0);
    }

    #[tokio::test]
    async fn empty_scope_has_zero_rate() {
        let c = campus();
        c.store.add_survey(c.students[0], c.professor, c.databases);

        let summary = aggregate(&c.store, Scope::Professor(c.professor)).await.unwrap();
        assert_eq!(summary.counts, SentimentCounts::default());
        assert_eq!(summary.total, 0);
        assert_eq!(summary.satisfaction_rate, 0.0);

        let summary = aggregate(&c.store, Scope::Institution).await.unwrap();
        assert_eq!(summary.total, 0);
        assert_eq!(summary.satisfaction_rate, 0.0);
    }

    #[tokio::test]
    async fn subject_scope_narrows_to_pair() {
        let c = campus();
        let algebra = c.store.add_subject("MAT-101", "Álgebra", c.professor);
        let s = &c.students;
        c.store.add_completed(s[0], c.professor, c.databases, Sentiment::Positive, at(1));
        c.store.add_completed(s[1], c.professor, algebra, Sentiment::Negative, at(2));
        c.store.add_completed(s[2], c.professor, algebra, Sentiment::Positive, at(3));

        let summary = aggregate(
            &c.store,
            Scope::Subject {
                professor_id: c.professor,
                subject_id: algebra,
            },
        )
        .await
        .unwrap();

        assert_eq!(summary.total, 2);
        assert_eq!(summary.satisfaction_rate, 50.0);
    }

    #[tokio::test]
    async fn institution_scope_spans_everyone() {
        let c = campus();
        let s = &c.students;
        c.store.add_completed(s[0], c.professor, c.databases, Sentiment::Positive, at(1));
        c.store.add_completed(s[1], c.other_professor, c.networks, Sentiment::Negative, at(2));
        c.store.add_completed(s[2], c.other_professor, c.networks, Sentiment::Positive, at(3));

        let summary = aggregate(&c.store, Scope::Institution).await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.satisfaction_rate, 66.7);
    }

    #[tokio::test]
    async fn unknown_scopes_are_not_found() {
        let c = campus();

        let err = aggregate(&c.store, Scope::Professor(999)).await.unwrap_err();
        assert_eq!(err.to_string(), "Professor 999 not found");

        // A student id is not a professor.
        let err = aggregate(&c.store, Scope::Professor(c.students[0]))
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluationError::NotFound(_)));

        let err = aggregate(
            &c.store,
            Scope::Subject {
                professor_id: c.professor,
                subject_id: 999,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Subject 999 not found");
    }

    #[tokio::test]
    async fn recent_comments_are_newest_first_and_bounded() {
        let c = campus();
        let s = &c.students;
        let oldest = c.store.add_completed(s[0], c.professor, c.databases, Sentiment::Neutral, at(1));
        let tie_first = c.store.add_completed(s[1], c.professor, c.databases, Sentiment::Positive, at(5));
        let tie_second = c.store.add_completed(s[2], c.professor, c.databases, Sentiment::Negative, at(5));
        let newest = c.store.add_completed(s[3], c.professor, c.databases, Sentiment::Positive, at(9));

        let now = at(10);
        let recent = recent_comments(&c.store, Scope::Professor(c.professor), 3, now)
            .await
            .unwrap();

        let ids: Vec<i64> = recent.iter().map(|r| r.survey_id).collect();
        assert_eq!(ids, vec![newest, tie_first, tie_second]);
        assert!(!ids.contains(&oldest));
        assert_eq!(recent[0].subject, "Bases de Datos");
        assert_eq!(recent[0].days_ago, 1);
        assert_eq!(recent[1].days_ago, 5);
    }

    #[tokio::test]
    async fn recent_comments_default_limit_is_ten() {
        let c = campus();
        for day in 1..=12 {
            let student = c.store.add_user("Alumno", "Extra", Role::Student);
            c.store
                .add_completed(student, c.professor, c.databases, Sentiment::Positive, at(day));
        }

        let recent = recent_comments(
            &c.store,
            Scope::Professor(c.professor),
            RECENT_COMMENT_LIMIT,
            at(20) + Duration::hours(1),
        )
        .await
        .unwrap();

        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].completed_at, Some(at(12)));
        assert_eq!(recent[9].completed_at, Some(at(3)));
    }

    #[tokio::test]
    async fn overview_counts_students_once() {
        let c = campus();
        let s = &c.students;
        c.store.add_completed(s[0], c.professor, c.databases, Sentiment::Positive, at(1));
        c.store.add_completed(s[0], c.other_professor, c.networks, Sentiment::Negative, at(2));
        c.store.add_completed(s[1], c.professor, c.databases, Sentiment::Positive, at(3));
        c.store.add_survey(s[2], c.professor, c.databases);
        let canceled = c.store.add_survey(s[3], c.professor, c.databases);
        c.store.set_status(canceled, SurveyStatus::Canceled);
        c.store.add_user("Admin", "Sistema", Role::Admin);
        c.store.add_group(c.databases, c.professor, "501", 25);

        let overview = institution_overview(&c.store).await.unwrap();

        assert_eq!(overview.total_surveys, 5);
        assert_eq!(overview.completed_surveys, 3);
        assert_eq!(overview.pending_surveys, 1);
        assert_eq!(overview.canceled_surveys, 1);
        assert_eq!(overview.students_with_surveys, 2);
        assert_eq!(
            overview.registry,
            RegistryCounts {
                total_students: 6,
                total_professors: 2,
                total_admins: 1,
                total_subjects: 2,
                total_groups: 1,
            }
        );
        assert_eq!(overview.sentiment.total, 3);
        assert_eq!(overview.sentiment.satisfaction_rate, 66.7);
    }

    #[tokio::test]
    async fn breakdown_covers_each_subject() {
        let c = campus();
        let algebra = c.store.add_subject("MAT-101", "Álgebra", c.professor);
        let s = &c.students;
        c.store.add_completed(s[0], c.professor, c.databases, Sentiment::Positive, at(1));
        c.store.add_completed(s[1], c.professor, c.databases, Sentiment::Negative, at(2));

        let breakdown = subject_breakdown(&c.store, c.professor).await.unwrap();

        assert_eq!(breakdown.len(), 2);
        assert_eq!(breakdown[0].subject.id, c.databases);
        assert_eq!(breakdown[0].sentiment.satisfaction_rate, 50.0);
        assert_eq!(breakdown[1].subject.id, algebra);
        assert_eq!(breakdown[1].sentiment.total, 0);
        assert_eq!(breakdown[1].sentiment.satisfaction_rate, 0.0);
    }

    #[tokio::test]
    async fn dashboard_sums_groups_and_sentiment() {
        let c = campus();
        c.store.add_group(c.databases, c.professor, "501", 25);
        c.store.add_group(c.databases, c.professor, "502", 28);
        c.store.add_group(c.networks, c.other_professor, "701", 30);
        c.store
            .add_completed(c.students[0], c.professor, c.databases, Sentiment::Positive, at(1));

        let dashboard = professor_dashboard(&c.store, c.professor, at(2)).await.unwrap();

        assert_eq!(dashboard.professor_name, "Juan Pérez");
        assert_eq!(dashboard.total_subjects, 1);
        assert_eq!(dashboard.total_groups, 2);
        assert_eq!(dashboard.total_students, 53);
        let names: Vec<&str> = dashboard
            .groups
            .iter()
            .map(|load| load.group.group_name.as_str())
            .collect();
        assert_eq!(names, vec!["501", "502"]);
        assert_eq!(dashboard.groups[0].subject, "Bases de Datos");
        assert_eq!(dashboard.sentiment.satisfaction_rate, 100.0);
        assert_eq!(dashboard.recent_comments.len(), 1);
    }

    #[tokio::test]
    async fn submission_moves_professor_aggregate() {
        use std::collections::BTreeMap;
        use std::sync::Arc;

        use crate::survey::SurveyService;
        use crate::test_utils::trained_classifier;

        let c = campus();
        let s = &c.students;
        c.store.add_completed(s[0], c.professor, c.databases, Sentiment::Positive, at(1));
        c.store.add_completed(s[1], c.professor, c.databases, Sentiment::Negative, at(2));
        let pending = c.store.add_survey(s[2], c.professor, c.databases);

        let store = Arc::new(c.store);
        let before = aggregate(store.as_ref(), Scope::Professor(c.professor))
            .await
            .unwrap();

        let service = SurveyService::new(store.clone(), Arc::new(trained_classifier()));
        let answers = BTreeMap::from([("q1".to_string(), 5)]);
        let outcome = service
            .submit(pending, s[2], &answers, "El profesor explica muy bien la materia")
            .await
            .unwrap();
        assert_eq!(outcome.sentiment, Sentiment::Positive);

        let after = aggregate(store.as_ref(), Scope::Professor(c.professor))
            .await
            .unwrap();
        assert_eq!(after.total, before.total + 1);
        assert_eq!(after.counts.positive, before.counts.positive + 1);
        assert_eq!(before.satisfaction_rate, 50.0);
        assert_eq!(after.satisfaction_rate, 66.7);
    }

    #[test]
    fn summary_serializes_flat() {
        let summary: SentimentSummary = SentimentCounts {
            positive: 3,
            neutral: 1,
            negative: 1,
        }
        .into();
        let json = serde_json::to_value(summary).unwrap();

        assert_eq!(json["positive"], 3);
        assert_eq!(json["total"], 5);
        assert_eq!(json["satisfaction_rate"], 60.0);
    }
}
