use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

mod aggregate;
mod bayes;
mod db;
mod error;
mod models;
mod report;
mod sentiment;
mod store;
mod survey;
#[cfg(test)]
mod test_utils;

use crate::aggregate::{Scope, RECENT_COMMENT_LIMIT};
use crate::bayes::ModelDirectory;
use crate::db::PgStore;
use crate::error::EvaluationError;
use crate::sentiment::{Classification, ModelError, SentimentClassifier};
use crate::survey::SurveyService;

#[derive(Parser)]
#[command(name = "faculty-evaluation")]
#[command(about = "Faculty evaluation surveys with comment sentiment analysis", long_about = None)]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[arg(long, default_value_t = 5, global = true)]
    max_connections: u32,

    /// Directory holding model.json and label_mappings.json
    #[arg(long, env = "EVALUATION_MODEL_DIR", default_value = "final_model", global = true)]
    model_dir: PathBuf,

    /// Log filter, e.g. "info" or "faculty_evaluation=debug"
    #[arg(long, env = "EVALUATION_LOG", default_value = "warn", global = true)]
    log_level: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load seed users, subjects, groups and pending surveys
    Seed,
    /// Provision pending surveys from a CSV of student_id,professor_id,subject_id
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// List a student's surveys
    Surveys {
        #[arg(long)]
        student: i64,
    },
    /// List the professors a student evaluates, grouped with their subjects
    Professors {
        #[arg(long)]
        student: i64,
    },
    /// Show one survey with its comment and answers
    Show {
        #[arg(long)]
        survey: i64,
        #[arg(long)]
        student: i64,
    },
    /// Submit a completed survey
    Submit {
        #[arg(long)]
        survey: i64,
        #[arg(long)]
        student: i64,
        /// Question rating as QUESTION=RATING, repeatable
        #[arg(long = "answer", value_parser = parse_answer)]
        answers: Vec<(String, i32)>,
        #[arg(long)]
        comment: String,
    },
    /// Cancel a pending survey
    Cancel {
        #[arg(long)]
        survey: i64,
    },
    /// Professor dashboard: teaching load, sentiment and recent comments
    Dashboard {
        #[arg(long)]
        professor: i64,
    },
    /// Sentiment per subject for one professor
    Subjects {
        #[arg(long)]
        professor: i64,
    },
    /// Institution-wide survey and sentiment statistics
    Overview,
    /// Generate a markdown report for a professor or the whole institution
    Report {
        #[arg(long)]
        professor: Option<i64>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Fit a sentiment model from a CSV of comment,label
    Train {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, default_value = "final_model")]
        out: PathBuf,
    },
    /// Classify a comment with the configured model
    Classify {
        #[arg(long)]
        text: String,
    },
}

fn parse_answer(raw: &str) -> Result<(String, i32), String> {
    let (question, rating) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected QUESTION=RATING, got '{raw}'"))?;
    let question = question.trim();
    if question.is_empty() {
        return Err(format!("missing question id in '{raw}'"));
    }
    let rating = rating
        .trim()
        .parse::<i32>()
        .map_err(|err| format!("invalid rating in '{raw}': {err}"))?;
    Ok((question.to_string(), rating))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Classifier over the model directory, loaded eagerly. A model with wrong
/// or conflicting labels is fatal; a missing model leaves comments
/// classified neutral.
fn warm_classifier(model_dir: &Path) -> anyhow::Result<Arc<SentimentClassifier>> {
    let classifier = SentimentClassifier::new(ModelDirectory::new(model_dir));
    match classifier.warm_up() {
        Ok(()) => debug!(path = %model_dir.display(), "sentiment model loaded"),
        Err(err @ (ModelError::LabelMismatch { .. } | ModelError::MappingConflict { .. })) => {
            return Err(err.into())
        }
        Err(err) => warn!(error = %err, "continuing without sentiment model"),
    }
    Ok(Arc::new(classifier))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => Ok(()),
        Err(err) => match err.downcast_ref::<EvaluationError>() {
            Some(evaluation) => {
                if evaluation.is_internal() {
                    error!(error = %evaluation, "command failed");
                }
                eprintln!("Error: {}", evaluation.user_message());
                std::process::exit(1);
            }
            None => Err(err),
        },
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Train { csv, out } => {
            let model = bayes::train_from_csv(&csv)?;
            model.save(&out)?;
            println!(
                "Model {} trained from {} and written to {}.",
                model.model_id,
                csv.display(),
                out.display()
            );
            return Ok(());
        }
        Commands::Classify { text } => {
            let classifier = warm_classifier(&cli.model_dir)?;
            let classification = classifier.classify(&text);
            if cli.json {
                return print_json(&classification_json(&classification));
            }
            match &classification {
                Classification::Model {
                    sentiment,
                    confidence,
                    scores,
                } => println!(
                    "{sentiment} ({confidence:.3}) positive {:.3}, neutral {:.3}, negative {:.3}",
                    scores.positive, scores.neutral, scores.negative
                ),
                Classification::Degraded { reason } => {
                    println!("neutral (0.500) model unavailable: {reason}")
                }
            }
            return Ok(());
        }
        _ => {}
    }

    let database_url = cli
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to a Postgres instance")?;
    let pool = PgPoolOptions::new()
        .max_connections(cli.max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PgStore::new(pool));
    let now = Utc::now();

    match cli.command {
        Commands::InitDb => {
            db::init_db(store.pool()).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(store.pool()).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let summary = survey::provision_from_csv(store.as_ref(), &csv).await?;
            println!(
                "Created {} surveys from {} ({} duplicates skipped).",
                summary.created,
                csv.display(),
                summary.duplicates
            );
        }
        Commands::Surveys { student } => {
            let service = SurveyService::new(store, lazy_classifier(&cli.model_dir));
            let surveys = service.surveys_for_student(student).await?;
            if cli.json {
                return print_json(&surveys);
            }
            if surveys.is_empty() {
                println!("No surveys for student {student}.");
            }
            for entry in &surveys {
                println!(
                    "- #{} {} {} with {} [{}]",
                    entry.survey.id,
                    entry.subject_code,
                    entry.subject_name,
                    entry.professor_name,
                    entry.survey.status
                );
            }
        }
        Commands::Professors { student } => {
            let service = SurveyService::new(store, lazy_classifier(&cli.model_dir));
            let professors = service.professors_for_student(student).await?;
            if cli.json {
                return print_json(&professors);
            }
            if professors.is_empty() {
                println!("No professors to evaluate for student {student}.");
            }
            for professor in &professors {
                println!("{}", professor.name);
                for subject in &professor.subjects {
                    println!(
                        "  - {} {} (survey #{}, {})",
                        subject.code, subject.name, subject.survey_id, subject.survey_status
                    );
                }
            }
        }
        Commands::Show { survey, student } => {
            let service = SurveyService::new(store, lazy_classifier(&cli.model_dir));
            let detail = service.survey_detail(survey, student).await?;
            if cli.json {
                return print_json(&detail);
            }
            println!("Survey #{} [{}]", detail.survey.id, detail.survey.status);
            if let Some(comment) = &detail.comment {
                println!(
                    "Comment ({} {:.3}): {}",
                    comment.sentiment, comment.confidence_score, comment.text
                );
            }
            for answer in &detail.answers {
                println!("- {}: {}", answer.question_id, answer.rating);
            }
        }
        Commands::Submit {
            survey,
            student,
            answers,
            comment,
        } => {
            let service = SurveyService::new(store, warm_classifier(&cli.model_dir)?);
            let answers: BTreeMap<String, i32> = answers.into_iter().collect();
            let outcome = service.submit(survey, student, &answers, &comment).await?;
            if cli.json {
                return print_json(&outcome);
            }
            println!(
                "Survey #{} {}: comment classified {} ({:.3}){}.",
                outcome.survey_id,
                outcome.status,
                outcome.sentiment,
                outcome.confidence,
                if outcome.degraded {
                    ", model unavailable"
                } else {
                    ""
                }
            );
        }
        Commands::Cancel { survey } => {
            let service = SurveyService::new(store, lazy_classifier(&cli.model_dir));
            let canceled = service.cancel(survey).await?;
            println!("Survey #{} {}.", canceled.id, canceled.status);
        }
        Commands::Dashboard { professor } => {
            let dashboard = aggregate::professor_dashboard(store.as_ref(), professor, now).await?;
            if cli.json {
                return print_json(&dashboard);
            }
            println!("{}", dashboard.professor_name);
            println!(
                "{} subjects, {} groups, {} students",
                dashboard.total_subjects, dashboard.total_groups, dashboard.total_students
            );
            println!("{}", report::sentiment_line(&dashboard.sentiment));
            for comment in &dashboard.recent_comments {
                println!(
                    "- [{}] {} ({}): {}",
                    comment.sentiment,
                    comment.subject,
                    report::relative_day(comment.days_ago),
                    comment.text
                );
            }
        }
        Commands::Subjects { professor } => {
            let breakdown = aggregate::subject_breakdown(store.as_ref(), professor).await?;
            if cli.json {
                return print_json(&breakdown);
            }
            if breakdown.is_empty() {
                println!("No active subjects for professor {professor}.");
            }
            for summary in &breakdown {
                println!(
                    "- {} {}: {}",
                    summary.subject.code,
                    summary.subject.name,
                    report::sentiment_line(&summary.sentiment)
                );
            }
        }
        Commands::Overview => {
            let overview = aggregate::institution_overview(store.as_ref()).await?;
            if cli.json {
                return print_json(&overview);
            }
            println!(
                "{} surveys: {} completed, {} pending, {} canceled",
                overview.total_surveys,
                overview.completed_surveys,
                overview.pending_surveys,
                overview.canceled_surveys
            );
            println!("{} students answered", overview.students_with_surveys);
            println!(
                "{} students, {} professors, {} administrators, {} subjects, {} groups",
                overview.registry.total_students,
                overview.registry.total_professors,
                overview.registry.total_admins,
                overview.registry.total_subjects,
                overview.registry.total_groups
            );
            println!("{}", report::sentiment_line(&overview.sentiment));
        }
        Commands::Report { professor, out } => {
            let generated_on = now.date_naive();
            let report = match professor {
                Some(professor_id) => {
                    let dashboard =
                        aggregate::professor_dashboard(store.as_ref(), professor_id, now).await?;
                    let subjects =
                        aggregate::subject_breakdown(store.as_ref(), professor_id).await?;
                    report::build_professor_report(&dashboard, &subjects, generated_on)
                }
                None => {
                    let overview = aggregate::institution_overview(store.as_ref()).await?;
                    let recent = aggregate::recent_comments(
                        store.as_ref(),
                        Scope::Institution,
                        RECENT_COMMENT_LIMIT,
                        now,
                    )
                    .await?;
                    report::build_institution_report(&overview, &recent, generated_on)
                }
            };
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Train { .. } | Commands::Classify { .. } => {}
    }

    Ok(())
}

/// Classifier that only loads its model if a command actually classifies.
fn lazy_classifier(model_dir: &Path) -> Arc<SentimentClassifier> {
    Arc::new(SentimentClassifier::new(ModelDirectory::new(model_dir)))
}

fn classification_json(classification: &Classification) -> serde_json::Value {
    match classification {
        Classification::Model {
            sentiment,
            confidence,
            scores,
        } => serde_json::json!({
            "sentiment": sentiment,
            "confidence": confidence,
            "scores": scores,
            "degraded": false,
        }),
        Classification::Degraded { reason } => serde_json::json!({
            "sentiment": classification.sentiment(),
            "confidence": classification.confidence(),
            "degraded": true,
            "reason": reason,
        }),
    }
}
