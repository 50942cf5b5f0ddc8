//! Plain-text rendering of controller state for the terminal.

use std::fmt::Write as _;

use session_core::{ControllerView, Notice, Phase, SessionError};
use shared::{
    domain::{ChatMessage, CoachReport, SessionRecord},
    stats::HistoryStats,
};

pub fn step_title(step: u8) -> &'static str {
    match step {
        1 => "Focus",
        2 => "Impressions",
        3 => "Sketch",
        _ => "Review",
    }
}

pub fn describe_view(view: &ControllerView) -> String {
    let mut out = String::new();
    match view.phase {
        Phase::Idle if view.loading => out.push_str("acquiring target..."),
        Phase::Idle => {
            let who = view
                .identity
                .as_ref()
                .map(|i| i.display_name.clone().unwrap_or_else(|| i.user_id.to_string()))
                .unwrap_or_else(|| "nobody (use 'login')".into());
            let _ = write!(
                out,
                "idle | signed in as {who} | {} sessions",
                view.stats.total_sessions
            );
        }
        Phase::Viewing => {
            let step = view.step.unwrap_or(1);
            let coordinate = view
                .coordinate
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            let _ = write!(
                out,
                "target {coordinate} | step {step}/4: {}",
                step_title(step)
            );
            match step {
                2 => {
                    let _ = write!(out, "\n  notes: {}", display_or(&view.notes, "(none)"));
                }
                4 => {
                    let _ = write!(
                        out,
                        "\n  notes: {}\n  sketch: {}",
                        display_or(&view.notes, "No notes recorded."),
                        if view.sketch.is_some() {
                            "attached"
                        } else {
                            "No sketch drawn"
                        }
                    );
                }
                _ => {}
            }
        }
        Phase::Analyzing => out.push_str("analyzing with the judge..."),
        Phase::Feedback => match &view.result {
            Some(record) => {
                let _ = write!(
                    out,
                    "score {}/100 for {}\n  {}\n  target: {}",
                    record.score, record.coordinate, record.feedback, record.target.display_handle
                );
            }
            None => out.push_str("feedback"),
        },
    }
    if view.exit_confirmation_pending {
        out.push_str("\n  leave this session? unsaved progress is lost ('confirm' / 'stay')");
    }
    out
}

pub fn describe_notice(notice: &Notice) -> Option<String> {
    match notice {
        Notice::Failure(err) => Some(describe_failure(err)),
        Notice::AuthenticationRequired => Some("please sign in first: login <user-id>".into()),
        Notice::SessionStarted { coordinate } => Some(format!("session started: {coordinate}")),
        Notice::FeedbackReady { score, .. } => Some(format!("saved, scored {score}")),
        Notice::CoachReportReady => Some("coaching report ready ('coach' to view)".into()),
        // replies are printed from the conversation itself
        Notice::CoachReplied | Notice::ExitConfirmationRequired | Notice::SessionEnded => None,
    }
}

fn describe_failure(err: &SessionError) -> String {
    if err.is_retryable() {
        format!("{err} (try again)")
    } else {
        err.to_string()
    }
}

pub fn describe_history(records: &[SessionRecord]) -> String {
    if records.is_empty() {
        return "no sessions yet".into();
    }
    let mut out = String::new();
    for record in records.iter().rev() {
        let _ = writeln!(
            out,
            "{}  {}  {:>3}  {}",
            record.timestamp.format("%Y-%m-%d %H:%M"),
            record.coordinate,
            record.score.value(),
            record.feedback
        );
    }
    out.truncate(out.trim_end().len());
    out
}

pub fn describe_stats(stats: &HistoryStats) -> String {
    format!(
        "sessions {} | average {} | best {} | practice {}",
        stats.total_sessions,
        stats.average_score,
        stats.best_score,
        stats.formatted_total_time()
    )
}

pub fn describe_report(report: &CoachReport) -> String {
    let mut out = report.trend_summary.clone();
    for (title, items) in [
        ("strengths", &report.strengths),
        ("weaknesses", &report.weaknesses),
        ("tips", &report.training_tips),
        ("next steps", &report.future_steps),
    ] {
        if items.is_empty() {
            continue;
        }
        let _ = write!(out, "\n{title}:");
        for item in items {
            let _ = write!(out, "\n  - {item}");
        }
    }
    out
}

pub fn describe_chat_message(message: &ChatMessage) -> String {
    format!(
        "[{}] {}: {}",
        message.timestamp.format("%H:%M"),
        message.role,
        message.text
    )
}

pub fn describe_conversation(conversation: &[ChatMessage]) -> String {
    if conversation.is_empty() {
        return "no conversation yet; ask with 'chat <question>'".into();
    }
    conversation
        .iter()
        .map(describe_chat_message)
        .collect::<Vec<_>>()
        .join("\n")
}

fn display_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

#[cfg(test)]
#[path = "tests/render_tests.rs"]
mod tests;
