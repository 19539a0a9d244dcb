use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::error::{EvaluationError, Result};
use crate::models::{
    Answer, Comment, CompletedSubmission, GroupClass, NewSurvey, RegistryCounts, Subject, Survey,
    SurveyFilter, SurveyStatus, User,
};
use crate::store::RecordStore;

const SURVEY_COLUMNS: &str =
    "id, student_id, professor_id, subject_id, status, created_at, completed_at";
const COMMENT_COLUMNS: &str = "id, survey_id, text, sentiment, confidence_score, created_at";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let staff = vec![
        ("admin@uaem.mx", "Admin", "Sistema", "admin"),
        ("profesor@uaem.mx", "Juan", "Pérez", "professor"),
        ("laura.mendez@uaem.mx", "Laura", "Méndez", "professor"),
    ];
    let mut professor_ids = Vec::new();

    for (email, first_name, last_name, role) in staff {
        let id: i64 = sqlx::query(
            r#"
            INSERT INTO faculty_evaluation.users (email, first_name, last_name, role)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO UPDATE
            SET first_name = EXCLUDED.first_name, last_name = EXCLUDED.last_name
            RETURNING id
            "#,
        )
        .bind(email)
        .bind(first_name)
        .bind(last_name)
        .bind(role)
        .fetch_one(pool)
        .await?
        .get("id");

        if role == "professor" {
            professor_ids.push(id);
        }
    }

    let students = vec![
        ("A12345678", "María", "González"),
        ("A87654321", "Carlos", "Ramírez"),
    ];
    let mut student_ids = Vec::new();

    for (matricula, first_name, last_name) in students {
        let id: i64 = sqlx::query(
            r#"
            INSERT INTO faculty_evaluation.users (matricula, first_name, last_name, role)
            VALUES ($1, $2, $3, 'student')
            ON CONFLICT (matricula) DO UPDATE
            SET first_name = EXCLUDED.first_name, last_name = EXCLUDED.last_name
            RETURNING id
            "#,
        )
        .bind(matricula)
        .bind(first_name)
        .bind(last_name)
        .fetch_one(pool)
        .await?
        .get("id");
        student_ids.push(id);
    }

    let subjects = vec![
        ("ICO-301", "Programación Estructurada", professor_ids[0], 3, "301", 28),
        ("ICO-305", "Bases de Datos", professor_ids[0], 5, "501", 25),
        ("ICO-410", "Redes de Computadoras", professor_ids[1], 7, "701", 30),
    ];

    for (code, name, professor_id, semester, group_name, current_students) in subjects {
        let subject_id: i64 = sqlx::query(
            r#"
            INSERT INTO faculty_evaluation.subjects (code, name, professor_id, semester)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (code) DO UPDATE
            SET name = EXCLUDED.name, professor_id = EXCLUDED.professor_id
            RETURNING id
            "#,
        )
        .bind(code)
        .bind(name)
        .bind(professor_id)
        .bind(semester)
        .fetch_one(pool)
        .await?
        .get("id");

        sqlx::query(
            r#"
            INSERT INTO faculty_evaluation.group_classes
            (subject_id, professor_id, group_name, semester_period, current_students)
            VALUES ($1, $2, $3, '2026-1', $4)
            ON CONFLICT (subject_id, group_name, semester_period) DO NOTHING
            "#,
        )
        .bind(subject_id)
        .bind(professor_id)
        .bind(group_name)
        .bind(current_students)
        .execute(pool)
        .await?;

        for &student_id in &student_ids {
            sqlx::query(
                r#"
                INSERT INTO faculty_evaluation.surveys (student_id, professor_id, subject_id)
                VALUES ($1, $2, $3)
                ON CONFLICT ON CONSTRAINT unique_student_professor_subject DO NOTHING
                "#,
            )
            .bind(student_id)
            .bind(professor_id)
            .bind(subject_id)
            .execute(pool)
            .await?;
        }
    }

    Ok(())
}

fn survey_from_row(row: &PgRow) -> Result<Survey> {
    let status: String = row.try_get("status")?;
    Ok(Survey {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        professor_id: row.try_get("professor_id")?,
        subject_id: row.try_get("subject_id")?,
        status: status.parse().map_err(EvaluationError::Storage)?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn comment_from_row(row: &PgRow) -> Result<Comment> {
    let sentiment: String = row.try_get("sentiment")?;
    Ok(Comment {
        id: row.try_get("id")?,
        survey_id: row.try_get("survey_id")?,
        text: row.try_get("text")?,
        sentiment: sentiment.parse().map_err(EvaluationError::Storage)?,
        confidence_score: row.try_get("confidence_score")?,
        created_at: row.try_get("created_at")?,
    })
}

fn subject_from_row(row: &PgRow) -> Result<Subject> {
    Ok(Subject {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        professor_id: row.try_get("professor_id")?,
        semester: row.try_get("semester")?,
        is_active: row.try_get("is_active")?,
    })
}

/// Postgres-backed record store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lock the survey row inside `tx` and return its current status.
    async fn lock_status(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: i64,
    ) -> Result<SurveyStatus> {
        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM faculty_evaluation.surveys WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        status
            .ok_or_else(|| EvaluationError::NotFound(format!("Survey {id}")))?
            .parse()
            .map_err(EvaluationError::Storage)
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn fetch_survey(&self, id: i64) -> Result<Option<Survey>> {
        let query = format!("SELECT {SURVEY_COLUMNS} FROM faculty_evaluation.surveys WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(survey_from_row).transpose()
    }

    async fn fetch_surveys(&self, filter: SurveyFilter) -> Result<Vec<Survey>> {
        let mut query = format!("SELECT {SURVEY_COLUMNS} FROM faculty_evaluation.surveys");

        match filter {
            SurveyFilter::Student(_) => query.push_str(" WHERE student_id = $1"),
            SurveyFilter::Professor {
                subject_id: None, ..
            } => query.push_str(" WHERE professor_id = $1"),
            SurveyFilter::Professor {
                subject_id: Some(_),
                ..
            } => query.push_str(" WHERE professor_id = $1 AND subject_id = $2"),
            SurveyFilter::All => {}
        }
        query.push_str(" ORDER BY id");

        let mut rows = sqlx::query(&query);
        match filter {
            SurveyFilter::Student(student_id) => rows = rows.bind(student_id),
            SurveyFilter::Professor {
                professor_id,
                subject_id,
            } => {
                rows = rows.bind(professor_id);
                if let Some(subject_id) = subject_id {
                    rows = rows.bind(subject_id);
                }
            }
            SurveyFilter::All => {}
        }

        let records = rows.fetch_all(&self.pool).await?;
        records.iter().map(survey_from_row).collect()
    }

    async fn fetch_comments(&self, survey_ids: &[i64]) -> Result<Vec<Comment>> {
        if survey_ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = format!(
            "SELECT {COMMENT_COLUMNS} FROM faculty_evaluation.comments \
             WHERE survey_id = ANY($1) ORDER BY id"
        );
        let records = sqlx::query(&query)
            .bind(survey_ids)
            .fetch_all(&self.pool)
            .await?;
        records.iter().map(comment_from_row).collect()
    }

    async fn fetch_answers(&self, survey_id: i64) -> Result<Vec<Answer>> {
        let records = sqlx::query(
            r#"
            SELECT survey_id, question_id, rating
            FROM faculty_evaluation.survey_answers
            WHERE survey_id = $1
            ORDER BY question_id
            "#,
        )
        .bind(survey_id)
        .fetch_all(&self.pool)
        .await?;

        let mut answers = Vec::new();
        for row in records {
            answers.push(Answer {
                survey_id: row.try_get("survey_id")?,
                question_id: row.try_get("question_id")?,
                rating: row.try_get("rating")?,
            });
        }
        Ok(answers)
    }

    async fn complete_survey(&self, submission: &CompletedSubmission) -> Result<(Survey, Comment)> {
        let mut tx = self.pool.begin().await?;

        // Dropping `tx` on any early return rolls everything back.
        let status = Self::lock_status(&mut tx, submission.survey_id).await?;
        if status != SurveyStatus::Pending {
            return Err(EvaluationError::InvalidState(status));
        }

        let insert_comment = format!(
            "INSERT INTO faculty_evaluation.comments \
             (survey_id, text, sentiment, confidence_score, created_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {COMMENT_COLUMNS}"
        );
        let comment_row = sqlx::query(&insert_comment)
            .bind(submission.survey_id)
            .bind(&submission.comment_text)
            .bind(submission.sentiment.as_str())
            .bind(submission.confidence_score)
            .bind(submission.completed_at)
            .fetch_one(&mut *tx)
            .await?;
        let comment = comment_from_row(&comment_row)?;

        for (question_id, rating) in &submission.answers {
            sqlx::query(
                r#"
                INSERT INTO faculty_evaluation.survey_answers (survey_id, question_id, rating)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(submission.survey_id)
            .bind(question_id)
            .bind(*rating)
            .execute(&mut *tx)
            .await?;
        }

        let update = format!(
            "UPDATE faculty_evaluation.surveys \
             SET status = 'completed', completed_at = $2 \
             WHERE id = $1 RETURNING {SURVEY_COLUMNS}"
        );
        let survey_row = sqlx::query(&update)
            .bind(submission.survey_id)
            .bind(submission.completed_at)
            .fetch_one(&mut *tx)
            .await?;
        let survey = survey_from_row(&survey_row)?;

        tx.commit().await?;
        Ok((survey, comment))
    }

    async fn cancel_survey(&self, id: i64) -> Result<Survey> {
        let mut tx = self.pool.begin().await?;

        let status = Self::lock_status(&mut tx, id).await?;
        if status != SurveyStatus::Pending {
            return Err(EvaluationError::NotCancelable(status));
        }

        let update = format!(
            "UPDATE faculty_evaluation.surveys SET status = 'canceled' \
             WHERE id = $1 RETURNING {SURVEY_COLUMNS}"
        );
        let row = sqlx::query(&update).bind(id).fetch_one(&mut *tx).await?;
        let survey = survey_from_row(&row)?;

        tx.commit().await?;
        Ok(survey)
    }

    async fn create_survey(&self, survey: &NewSurvey, created_at: DateTime<Utc>) -> Result<Survey> {
        let insert = format!(
            "INSERT INTO faculty_evaluation.surveys \
             (student_id, professor_id, subject_id, created_at) \
             VALUES ($1, $2, $3, $4) RETURNING {SURVEY_COLUMNS}"
        );
        let row = sqlx::query(&insert)
            .bind(survey.student_id)
            .bind(survey.professor_id)
            .bind(survey.subject_id)
            .bind(created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| {
                if let sqlx::Error::Database(db) = &err {
                    if db.is_unique_violation() {
                        return EvaluationError::Conflict(format!(
                            "student {} already evaluates professor {} for subject {}",
                            survey.student_id, survey.professor_id, survey.subject_id
                        ));
                    }
                    if db.is_foreign_key_violation() {
                        return EvaluationError::NotFound(
                            "Student, professor or subject".to_string(),
                        );
                    }
                }
                EvaluationError::Database(err)
            })?;
        survey_from_row(&row)
    }

    async fn fetch_user(&self, id: i64) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, first_name, last_name, role FROM faculty_evaluation.users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let role: String = row.try_get("role")?;
        Ok(Some(User {
            id: row.try_get("id")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            role: role.parse().map_err(EvaluationError::Storage)?,
        }))
    }

    async fn fetch_subject(&self, id: i64) -> Result<Option<Subject>> {
        let row = sqlx::query(
            r#"
            SELECT id, code, name, professor_id, semester, is_active
            FROM faculty_evaluation.subjects
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subject_from_row).transpose()
    }

    async fn subjects_for_professor(&self, professor_id: i64) -> Result<Vec<Subject>> {
        let records = sqlx::query(
            r#"
            SELECT id, code, name, professor_id, semester, is_active
            FROM faculty_evaluation.subjects
            WHERE professor_id = $1 AND is_active
            ORDER BY id
            "#,
        )
        .bind(professor_id)
        .fetch_all(&self.pool)
        .await?;
        records.iter().map(subject_from_row).collect()
    }

    async fn groups_for_professor(&self, professor_id: i64) -> Result<Vec<GroupClass>> {
        let records = sqlx::query(
            r#"
            SELECT id, subject_id, professor_id, group_name, semester_period, current_students
            FROM faculty_evaluation.group_classes
            WHERE professor_id = $1 AND is_active
            ORDER BY id
            "#,
        )
        .bind(professor_id)
        .fetch_all(&self.pool)
        .await?;

        let mut groups = Vec::new();
        for row in records {
            groups.push(GroupClass {
                id: row.try_get("id")?,
                subject_id: row.try_get("subject_id")?,
                professor_id: row.try_get("professor_id")?,
                group_name: row.try_get("group_name")?,
                semester_period: row.try_get("semester_period")?,
                current_students: row.try_get("current_students")?,
            });
        }
        Ok(groups)
    }

    async fn registry_counts(&self) -> Result<RegistryCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM faculty_evaluation.users WHERE role = 'student')
                    AS total_students,
                (SELECT COUNT(*) FROM faculty_evaluation.users WHERE role = 'professor')
                    AS total_professors,
                (SELECT COUNT(*) FROM faculty_evaluation.users WHERE role = 'admin')
                    AS total_admins,
                (SELECT COUNT(*) FROM faculty_evaluation.subjects) AS total_subjects,
                (SELECT COUNT(*) FROM faculty_evaluation.group_classes) AS total_groups
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(RegistryCounts {
            total_students: row.try_get("total_students")?,
            total_professors: row.try_get("total_professors")?,
            total_admins: row.try_get("total_admins")?,
            total_subjects: row.try_get("total_subjects")?,
            total_groups: row.try_get("total_groups")?,
        })
    }
}
