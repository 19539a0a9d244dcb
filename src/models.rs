use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SurveyStatus {
    Pending,
    Completed,
    Canceled,
}

impl SurveyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SurveyStatus::Pending => "pending",
            SurveyStatus::Completed => "completed",
            SurveyStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for SurveyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SurveyStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(SurveyStatus::Pending),
            "completed" => Ok(SurveyStatus::Completed),
            "canceled" => Ok(SurveyStatus::Canceled),
            other => Err(format!("unknown survey status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sentiment {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "positive" => Ok(Sentiment::Positive),
            "neutral" => Ok(Sentiment::Neutral),
            "negative" => Ok(Sentiment::Negative),
            other => Err(format!("unknown sentiment '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Professor,
    Student,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "admin" => Ok(Role::Admin),
            "professor" => Ok(Role::Professor),
            "student" => Ok(Role::Student),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Survey {
    pub id: i64,
    pub student_id: i64,
    pub professor_id: i64,
    pub subject_id: i64,
    pub status: SurveyStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewSurvey {
    pub student_id: i64,
    pub professor_id: i64,
    pub subject_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Comment {
    pub id: i64,
    pub survey_id: i64,
    pub text: String,
    pub sentiment: Sentiment,
    pub confidence_score: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub survey_id: i64,
    pub question_id: String,
    pub rating: i32,
}

/// Everything written when a pending survey is completed.
#[derive(Debug, Clone)]
pub struct CompletedSubmission {
    pub survey_id: i64,
    pub comment_text: String,
    pub sentiment: Sentiment,
    pub confidence_score: f64,
    pub answers: BTreeMap<String, i32>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Subject {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub professor_id: Option<i64>,
    pub semester: Option<i32>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupClass {
    pub id: i64,
    pub subject_id: i64,
    pub professor_id: i64,
    pub group_name: String,
    pub semester_period: Option<String>,
    pub current_students: i32,
}

/// Row counts of the registry tables, as shown on the institution overview.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryCounts {
    pub total_students: i64,
    pub total_professors: i64,
    pub total_admins: i64,
    pub total_subjects: i64,
    pub total_groups: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurveyFilter {
    Student(i64),
    Professor {
        professor_id: i64,
        subject_id: Option<i64>,
    },
    All,
}
