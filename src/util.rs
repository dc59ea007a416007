use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};

use crate::app::{ChallengeDetail, TemplateDetail};
use crate::entities::{challenge, day_task, event, event_user, invitation};

fn has_text(value: &Option<String>) -> bool {
    value
        .as_deref()
        .map(|text| !text.trim().is_empty())
        .unwrap_or(false)
}

pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M").to_string()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn tasks_by_day(tasks: &[day_task::Model]) -> BTreeMap<i32, Vec<&day_task::Model>> {
    let mut days: BTreeMap<i32, Vec<&day_task::Model>> = BTreeMap::new();
    for task in tasks {
        days.entry(task.day_number).or_default().push(task);
    }
    days
}

pub fn format_challenge_line(challenge: &challenge::Model) -> String {
    format!(
        "{} [{}] {} (day {}/{}, streak {}, {}%)",
        challenge.id,
        challenge.status,
        challenge.title,
        challenge.current_day,
        challenge.duration_days,
        challenge.streak_count,
        challenge.achievement_rate
    )
}

pub fn format_template_detail(detail: &TemplateDetail) -> String {
    let template = &detail.template;
    let mut output = String::new();
    output.push_str(&format!("Template ID: {}\n", template.id));
    output.push_str(&format!("Title: {}\n", template.title));
    output.push_str(&format!("Category: {}\n", template.category));
    output.push_str(&format!("Visibility: {}\n", template.visibility));
    output.push_str(&format!("Duration: {} days\n", template.duration_days));
    if template.is_system {
        output.push_str("System: yes\n");
    }
    if !template.is_active {
        output.push_str("Active: no\n");
    }
    output.push_str(&format!("Used: {}\n", template.usage_count));
    if has_text(&template.description) {
        output.push_str(&format!(
            "Description: {}\n",
            template.description.as_deref().unwrap_or("")
        ));
    }
    output.push('\n');
    if detail.days.is_empty() {
        output.push_str("Days: (none)");
        return output;
    }
    output.push_str("Days:\n");
    let mut current_day = 0;
    for day in &detail.days {
        if day.day_number != current_day {
            current_day = day.day_number;
            output.push_str(&format!("Day {current_day}\n"));
        }
        let marker = if day.is_required { "" } else { " (optional)" };
        output.push_str(&format!("- {}{marker}\n", day.title));
    }
    output.trim_end().to_string()
}

pub fn format_challenge_detail(detail: &ChallengeDetail, unlocked_day: i32) -> String {
    let challenge = &detail.challenge;
    let mut output = String::new();
    output.push_str(&format!("Challenge ID: {}\n", challenge.id));
    output.push_str(&format!("Title: {}\n", challenge.title));
    output.push_str(&format!("Status: {}\n", challenge.status));
    output.push_str(&format!("Mode: {}\n", challenge.mode));
    if let Some(template_id) = challenge.template_id {
        output.push_str(&format!("Template ID: {template_id}\n"));
    }
    output.push_str(&format!("Start: {}\n", format_date(challenge.start_date)));
    if let Some(end_date) = challenge.end_date {
        output.push_str(&format!("End: {}\n", format_date(end_date)));
    }
    output.push_str(&format!(
        "Day: {}/{} (unlocked {unlocked_day})\n",
        challenge.current_day, challenge.duration_days
    ));
    output.push_str(&format!("Streak: {}\n", challenge.streak_count));
    output.push_str(&format!("Achievement: {}%\n", challenge.achievement_rate));
    if let Some(last_check) = challenge.last_check_date {
        output.push_str(&format!("Last check: {}\n", format_date(last_check)));
    }
    if challenge.restart_count > 0 {
        output.push_str(&format!("Restarts: {}\n", challenge.restart_count));
    }
    if challenge.extension_count > 0 {
        output.push_str(&format!("Extensions: {}\n", challenge.extension_count));
    }
    output.push_str(&format!("Color: {}\n", challenge.color));
    if let Some(event) = &detail.event {
        output.push_str(&format!(
            "Event ID: {} (version {}, {})\n",
            event.id, event.lock_version, event.status
        ));
    }
    if has_text(&challenge.review) {
        output.push_str(&format!(
            "Review: {}\n",
            challenge.review.as_deref().unwrap_or("")
        ));
    }
    if has_text(&challenge.ai_summary) {
        output.push_str(&format!(
            "Summary: {}\n",
            challenge.ai_summary.as_deref().unwrap_or("")
        ));
    }
    output.push('\n');

    let days = tasks_by_day(&detail.tasks);
    match days.get(&unlocked_day) {
        Some(tasks) if !tasks.is_empty() => {
            output.push_str(&format!("Day {unlocked_day} tasks:\n"));
            for task in tasks {
                let marker = if task.is_done { "x" } else { " " };
                let optional = if task.is_required { "" } else { " (optional)" };
                output.push_str(&format!(
                    "- [{marker}] {}{optional} (task id {})\n",
                    task.title, task.id
                ));
            }
        }
        _ => output.push_str(&format!("Day {unlocked_day} tasks: (none)\n")),
    }
    output.trim_end().to_string()
}

pub fn format_event_detail(event: &event::Model, participants: &[event_user::Model]) -> String {
    let mut output = String::new();
    output.push_str(&format!("Event ID: {}\n", event.id));
    output.push_str(&format!("External ID: {}\n", event.external_id));
    output.push_str(&format!("Title: {}\n", event.title));
    output.push_str(&format!("Type: {}\n", event.event_type));
    output.push_str(&format!("Status: {}\n", event.status));
    output.push_str(&format!("Start: {}\n", format_datetime(event.start_at)));
    output.push_str(&format!("End: {}\n", format_datetime(event.end_at)));
    output.push_str(&format!("Color: {}\n", event.color));
    output.push_str(&format!("Version: {}\n", event.lock_version));
    if let Some(challenge_id) = event.challenge_id {
        output.push_str(&format!("Challenge ID: {challenge_id}\n"));
    }
    if has_text(&event.description) {
        output.push_str(&format!(
            "Description: {}\n",
            event.description.as_deref().unwrap_or("")
        ));
    }
    output.push('\n');
    output.push_str("Participants:\n");
    for participant in participants {
        match participant.email.as_deref() {
            Some(email) => output.push_str(&format!(
                "- {} <{email}> ({})\n",
                participant.user_id, participant.role
            )),
            None => output.push_str(&format!(
                "- {} ({})\n",
                participant.user_id, participant.role
            )),
        }
    }
    output.trim_end().to_string()
}

pub fn format_invitation_line(invitation: &invitation::Model) -> String {
    format!(
        "{} [{}] {} as {} (expires {})",
        invitation.id,
        invitation.status,
        invitation.email,
        invitation.role,
        format_datetime(invitation.expires_at)
    )
}

pub fn format_challenge_markdown(detail: &ChallengeDetail) -> String {
    fn push_line(lines: &mut Vec<String>, indent: usize, text: &str) {
        let mut line = String::new();
        line.push_str(&" ".repeat(indent));
        line.push_str(text);
        lines.push(line);
    }

    fn quote(lines: &mut Vec<String>, text: &str) {
        let normalized = text.replace("\r\n", "\n");
        for line in normalized.lines() {
            if line.is_empty() {
                push_line(lines, 0, ">");
            } else {
                push_line(lines, 0, &format!("> {line}"));
            }
        }
    }

    let challenge = &detail.challenge;
    let mut lines = Vec::new();
    push_line(&mut lines, 0, &format!("# Challenge: {}", challenge.title));
    lines.push(String::new());
    push_line(&mut lines, 0, &format!("- **Challenge ID:** `{}`", challenge.id));
    push_line(&mut lines, 0, &format!("- **Status:** `{}`", challenge.status));
    push_line(
        &mut lines,
        0,
        &format!(
            "- **Period:** {} .. {}",
            format_date(challenge.start_date),
            challenge
                .end_date
                .map(format_date)
                .unwrap_or_else(|| "?".to_string())
        ),
    );
    push_line(
        &mut lines,
        0,
        &format!(
            "- **Day:** {}/{}",
            challenge.current_day, challenge.duration_days
        ),
    );
    push_line(
        &mut lines,
        0,
        &format!("- **Streak:** {}", challenge.streak_count),
    );
    push_line(
        &mut lines,
        0,
        &format!("- **Achievement:** {}%", challenge.achievement_rate),
    );
    lines.push(String::new());

    push_line(&mut lines, 0, "## Days");
    lines.push(String::new());
    let days = tasks_by_day(&detail.tasks);
    if days.is_empty() {
        push_line(&mut lines, 0, "*No tasks*");
    }
    for (day, tasks) in &days {
        push_line(&mut lines, 0, &format!("### Day {day}"));
        lines.push(String::new());
        for task in tasks {
            let marker = if task.is_done { "x" } else { " " };
            let optional = if task.is_required { "" } else { " *(optional)*" };
            push_line(
                &mut lines,
                0,
                &format!("- [{marker}] {}{optional}", task.title),
            );
            if has_text(&task.description) {
                push_line(&mut lines, 2, task.description.as_deref().unwrap_or(""));
            }
        }
        lines.push(String::new());
    }

    if !detail.logs.is_empty() {
        push_line(&mut lines, 0, "## Daily logs");
        lines.push(String::new());
        for log in &detail.logs {
            let difficulty = log
                .difficulty_score
                .map(|score| format!(" (difficulty {score}/5)"))
                .unwrap_or_default();
            push_line(
                &mut lines,
                0,
                &format!("### {}{difficulty}", format_date(log.log_date)),
            );
            lines.push(String::new());
            match log.review_text.as_deref() {
                Some(text) if !text.trim().is_empty() => quote(&mut lines, text),
                _ => push_line(&mut lines, 0, "*No review*"),
            }
            lines.push(String::new());
        }
    }

    if has_text(&challenge.ai_summary) {
        push_line(&mut lines, 0, "## Summary");
        lines.push(String::new());
        quote(&mut lines, challenge.ai_summary.as_deref().unwrap_or(""));
    }

    lines.join("\n").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::daily_log;

    fn sample_detail() -> ChallengeDetail {
        let now = Utc::now();
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let task = |id: i64, day_number: i32, title: &str, is_required: bool, is_done: bool| {
            day_task::Model {
                id,
                challenge_id: 1,
                day_number,
                task_order: 1,
                title: title.to_string(),
                description: None,
                is_required,
                is_done,
                done_at: None,
                created_at: now,
                updated_at: now,
            }
        };
        ChallengeDetail {
            challenge: challenge::Model {
                id: 1,
                user_id: "alice".to_string(),
                template_id: None,
                title: "Run".to_string(),
                mode: "custom".to_string(),
                status: "active".to_string(),
                start_date: start,
                end_date: NaiveDate::from_ymd_opt(2024, 1, 2),
                duration_days: 2,
                current_day: 2,
                streak_count: 1,
                achievement_rate: 50,
                last_check_date: Some(start),
                restart_count: 0,
                extension_count: 0,
                review: None,
                ai_summary: None,
                color: "#4F46E5".to_string(),
                created_at: now,
                updated_at: now,
            },
            tasks: vec![
                task(1, 1, "Warm up", true, true),
                task(2, 1, "Cool down", false, false),
                task(3, 2, "Run 5k", true, false),
            ],
            logs: vec![daily_log::Model {
                id: 1,
                challenge_id: 1,
                log_date: start,
                review_text: Some("Legs hurt\n\nStill fun".to_string()),
                difficulty_score: Some(4),
                created_at: now,
                updated_at: now,
            }],
            event: None,
        }
    }

    #[test]
    fn detail_lists_only_the_unlocked_day() {
        let output = format_challenge_detail(&sample_detail(), 2);
        assert!(output.contains("Day: 2/2 (unlocked 2)"));
        assert!(output.contains("- [ ] Run 5k (task id 3)"));
        assert!(!output.contains("Warm up"));
    }

    #[test]
    fn markdown_groups_tasks_and_quotes_logs() {
        let markdown = format_challenge_markdown(&sample_detail());
        assert!(markdown.starts_with("# Challenge: Run"));
        assert!(markdown.contains("### Day 1\n\n- [x] Warm up\n- [ ] Cool down *(optional)*"));
        assert!(markdown.contains("### 2024-01-01 (difficulty 4/5)"));
        assert!(markdown.contains("> Legs hurt\n>\n> Still fun"));
        assert!(!markdown.contains("## Summary"));
    }
}
