use std::fmt::Write;

use chrono::NaiveDate;

use crate::aggregate::{
    InstitutionOverview, ProfessorDashboard, RecentComment, SentimentSummary, SubjectSummary,
};

/// Spanish relative-day label shown next to recent comments.
pub fn relative_day(days_ago: i64) -> String {
    match days_ago {
        0 => "Hoy".to_string(),
        1 => "Hace 1 día".to_string(),
        n => format!("Hace {n} días"),
    }
}

pub fn sentiment_line(summary: &SentimentSummary) -> String {
    format!(
        "{} positive, {} neutral, {} negative ({} comments, {:.1}% satisfaction)",
        summary.counts.positive,
        summary.counts.neutral,
        summary.counts.negative,
        summary.total,
        summary.satisfaction_rate
    )
}

fn write_recent(output: &mut String, recent: &[RecentComment]) {
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Comments");

    if recent.is_empty() {
        let _ = writeln!(output, "No completed surveys yet.");
        return;
    }

    for comment in recent {
        let _ = writeln!(
            output,
            "- [{}] {} ({}): {}",
            comment.sentiment,
            comment.subject,
            relative_day(comment.days_ago),
            comment.text
        );
    }
}

pub fn build_professor_report(
    dashboard: &ProfessorDashboard,
    subjects: &[SubjectSummary],
    generated_on: NaiveDate,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Faculty Evaluation Report");
    let _ = writeln!(
        output,
        "Generated for {} on {}",
        dashboard.professor_name, generated_on
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Teaching Load");
    let _ = writeln!(output, "- Subjects: {}", dashboard.total_subjects);
    let _ = writeln!(output, "- Groups: {}", dashboard.total_groups);
    let _ = writeln!(output, "- Students: {}", dashboard.total_students);

    for load in &dashboard.groups {
        let _ = writeln!(
            output,
            "- Group {} ({}, {}): {} students",
            load.group.group_name,
            load.subject,
            load.group.semester_period.as_deref().unwrap_or("no period"),
            load.group.current_students
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Sentiment");
    let _ = writeln!(output, "{}", sentiment_line(&dashboard.sentiment));

    let _ = writeln!(output);
    let _ = writeln!(output, "## By Subject");

    if subjects.is_empty() {
        let _ = writeln!(output, "No active subjects.");
    } else {
        for summary in subjects {
            let _ = writeln!(
                output,
                "- {} {}: {}",
                summary.subject.code,
                summary.subject.name,
                sentiment_line(&summary.sentiment)
            );
        }
    }

    write_recent(&mut output, &dashboard.recent_comments);
    output
}

pub fn build_institution_report(
    overview: &InstitutionOverview,
    recent: &[RecentComment],
    generated_on: NaiveDate,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Faculty Evaluation Report");
    let _ = writeln!(output, "Generated for the whole institution on {}", generated_on);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Surveys");
    let _ = writeln!(output, "- Total: {}", overview.total_surveys);
    let _ = writeln!(output, "- Completed: {}", overview.completed_surveys);
    let _ = writeln!(output, "- Pending: {}", overview.pending_surveys);
    let _ = writeln!(output, "- Canceled: {}", overview.canceled_surveys);
    let _ = writeln!(
        output,
        "- Students who answered: {}",
        overview.students_with_surveys
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Registry");
    let _ = writeln!(output, "- Students: {}", overview.registry.total_students);
    let _ = writeln!(output, "- Professors: {}", overview.registry.total_professors);
    let _ = writeln!(output, "- Administrators: {}", overview.registry.total_admins);
    let _ = writeln!(output, "- Subjects: {}", overview.registry.total_subjects);
    let _ = writeln!(output, "- Groups: {}", overview.registry.total_groups);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Sentiment");
    let _ = writeln!(output, "{}", sentiment_line(&overview.sentiment));

    write_recent(&mut output, recent);
    output
}
