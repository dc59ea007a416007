mod app;
mod cli;
mod collab;
mod config;
mod db;
mod entities;
mod error;
mod events;
mod model;
mod progress;
mod summary;
mod util;

use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app::{App, ProgressChanges, TemplateRemoval};
use crate::cli::{
    CategoryArg, ChallengeCommand, ChallengeCustom, ChallengeExport, ChallengeList, ChallengeLog,
    ChallengeStart, ChallengeStatusArg, ChallengeToggle, ChallengeUpdate, Cli, Command, EventAdd,
    EventCommand, EventInvite, EventRole, EventShow, EventStatusArg, EventTypeArg, EventUpdate,
    InviteCommand, RoleArg, TemplateAdd, TemplateCommand, VisibilityArg,
};
use crate::config::{Settings, EMAIL_ENV, LOG_ENV, USER_ENV};
use crate::error::AppError;
use crate::model::{
    ChallengeChanges, ChallengeInput, ChallengeStatus, DailyLogInput, EventInput, EventPatch,
    EventStatus, EventType, ParticipantRole, StatusAction, TaskInput, TemplateCategory,
    TemplateInput, TemplateVisibility,
};
use crate::progress::unlocked_day;
use crate::util::{
    format_challenge_detail, format_challenge_line, format_challenge_markdown, format_date,
    format_datetime, format_event_detail, format_invitation_line, format_template_detail,
};

/// Resolved "now" for one invocation.
#[derive(Clone, Copy)]
struct Clock {
    now: DateTime<Utc>,
    today: NaiveDate,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        if let AppError::VersionConflict { current, .. } = &err {
            if let Ok(json) = serde_json::to_string_pretty(current.as_ref()) {
                println!("{json}");
            }
        }
        eprintln!("Error: {err}");
        std::process::exit(err.exit_code());
    }
}

async fn run() -> Result<(), AppError> {
    let Cli {
        home,
        user,
        email,
        now,
        today,
        command,
    } = Cli::parse();

    let home = config::resolve_home(home)?;
    fs::create_dir_all(&home)?;
    let settings = config::load_settings(&home)?;
    init_tracing(&settings);

    let user_id = resolve_user(user)?;
    let email = email
        .or_else(|| std::env::var(EMAIL_ENV).ok())
        .filter(|value| !value.trim().is_empty());
    let now = now.unwrap_or_else(Utc::now);
    let clock = Clock {
        now,
        today: today.unwrap_or_else(|| settings.local_date(now)),
    };

    let db_path = db::resolve_db_path(&home);
    db::ensure_parent_dir(&db_path)?;
    let mut lock = db::open_lock(&db_path)?;
    let _guard = lock.write()?;

    let db = db::connect(&db_path).await?;
    db::ensure_schema(&db).await?;
    let app = App::new(db, user_id, email, settings);
    tracing::debug!(user = app.user_id(), today = %clock.today, "dayboard started");

    match command {
        Command::Template(command) => handle_template(&app, command).await,
        Command::Challenge(command) => handle_challenge(&app, &home, clock, command).await,
        Command::Event(command) => handle_event(&app, clock, command).await,
        Command::Invite(command) => handle_invite(&app, clock, command).await,
    }
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        EnvFilter::new(settings.log_filter.as_deref().unwrap_or("warn"))
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn resolve_user(user: Option<String>) -> Result<String, AppError> {
    let user = user
        .or_else(|| std::env::var(USER_ENV).ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    user.ok_or_else(|| {
        AppError::InvalidInput(format!("user is required; pass --user or set {USER_ENV}"))
    })
}

async fn handle_template(app: &App, command: TemplateCommand) -> Result<(), AppError> {
    match command {
        TemplateCommand::Add(args) => handle_template_add(app, args).await,
        TemplateCommand::List => {
            let templates = app.list_templates().await?;
            if templates.is_empty() {
                println!("No templates.");
                return Ok(());
            }
            println!(
                "{:<4} {:<5} {:<8} {:<9} {}",
                "ID", "DAYS", "CATEGORY", "VISIBLE", "TITLE"
            );
            for template in templates {
                println!(
                    "{:<4} {:<5} {:<8} {:<9} {}",
                    template.id,
                    template.duration_days,
                    template.category,
                    template.visibility,
                    template.title
                );
            }
            Ok(())
        }
        TemplateCommand::Show(args) => {
            let detail = app.get_template_detail(args.id).await?;
            println!("{}", format_template_detail(&detail));
            Ok(())
        }
        TemplateCommand::Remove(args) => {
            match app.delete_template(args.id).await? {
                TemplateRemoval::Deleted => println!("Removed template ID: {}", args.id),
                TemplateRemoval::Deactivated => println!(
                    "Deactivated template ID: {} (still referenced by challenges)",
                    args.id
                ),
            }
            Ok(())
        }
        TemplateCommand::Seed => {
            let created = app.seed_system_templates().await?;
            println!("Seeded {} system templates.", created.len());
            for template in created {
                println!("- {} {}", template.id, template.title);
            }
            Ok(())
        }
    }
}

async fn handle_template_add(app: &App, args: TemplateAdd) -> Result<(), AppError> {
    let tasks = parse_task_args(&args.tasks, &args.optional)?;
    let input = TemplateInput {
        title: args.title,
        description: args.description,
        category: category_from_arg(args.category),
        duration_days: args.days,
        visibility: visibility_from_arg(args.visibility),
    };
    let (template, count) = app.create_template(input, tasks).await?;
    println!("Created template ID: {} ({count} tasks)", template.id);
    Ok(())
}

async fn handle_challenge(
    app: &App,
    home: &Path,
    clock: Clock,
    command: ChallengeCommand,
) -> Result<(), AppError> {
    match command {
        ChallengeCommand::Start(args) => handle_challenge_start(app, clock, args).await,
        ChallengeCommand::Custom(args) => handle_challenge_custom(app, clock, args).await,
        ChallengeCommand::List(args) => handle_challenge_list(app, args).await,
        ChallengeCommand::Show(args) => {
            let detail = app.get_challenge_detail(args.id).await?;
            let unlocked = unlocked_day(
                detail.challenge.start_date,
                detail.challenge.duration_days,
                clock.today,
            );
            println!("{}", format_challenge_detail(&detail, unlocked));
            if app.can_retry(args.id, clock.today).await? {
                println!();
                println!(
                    "Day {} was missed; run `challenge retry {}` to restart.",
                    detail.challenge.current_day, args.id
                );
            }
            Ok(())
        }
        ChallengeCommand::Toggle(args) => handle_challenge_toggle(app, clock, args).await,
        ChallengeCommand::Retry(args) => {
            let (challenge, changes) = app.retry(args.id, clock.today).await?;
            println!(
                "Restarted challenge ID: {} on {} (restart #{}).",
                challenge.id,
                format_date(challenge.start_date),
                challenge.restart_count
            );
            print_progress_changes(&changes);
            Ok(())
        }
        ChallengeCommand::Extend(args) => {
            let (challenge, appended, changes) = app.extend(args.id).await?;
            println!(
                "Extended challenge ID: {} by {appended} days (now {} days, day {}).",
                challenge.id, challenge.duration_days, challenge.current_day
            );
            print_progress_changes(&changes);
            Ok(())
        }
        ChallengeCommand::Log(args) => handle_challenge_log(app, clock, args).await,
        ChallengeCommand::Logs(args) => {
            let logs = app.list_daily_logs(args.id).await?;
            if logs.is_empty() {
                println!("No logs.");
            }
            for log in logs {
                let difficulty = log
                    .difficulty_score
                    .map(|score| format!(" [{score}/5]"))
                    .unwrap_or_default();
                println!(
                    "{}{difficulty} {}",
                    format_date(log.log_date),
                    log.review_text.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        ChallengeCommand::Pause(args) => {
            handle_challenge_status(app, args.id, StatusAction::Pause).await
        }
        ChallengeCommand::Resume(args) => {
            handle_challenge_status(app, args.id, StatusAction::Resume).await
        }
        ChallengeCommand::Cancel(args) => {
            handle_challenge_status(app, args.id, StatusAction::Cancel).await
        }
        ChallengeCommand::Update(args) => handle_challenge_update(app, args).await,
        ChallengeCommand::Export(args) => handle_challenge_export(app, home, args).await,
        ChallengeCommand::Summarize(args) => {
            let Some(summarizer) = app.summarizer() else {
                return Err(AppError::InvalidInput(
                    "summary_command is not configured in config.toml".to_string(),
                ));
            };
            match app.refresh_ai_summary(args.id, &summarizer).await? {
                Some(challenge) => println!(
                    "Summary for challenge ID: {}\n{}",
                    challenge.id,
                    challenge.ai_summary.as_deref().unwrap_or("")
                ),
                None => println!("Summary generation failed for challenge ID: {}", args.id),
            }
            Ok(())
        }
    }
}

async fn handle_challenge_start(
    app: &App,
    clock: Clock,
    args: ChallengeStart,
) -> Result<(), AppError> {
    let input = ChallengeInput {
        title: args.title,
        color: args.color,
        start_date: args.start,
        with_event: args.with_event,
    };
    let (challenge, event) = app
        .start_from_template(args.template_id, input, clock.today)
        .await?;
    print_started(&challenge, event.as_ref());
    Ok(())
}

async fn handle_challenge_custom(
    app: &App,
    clock: Clock,
    args: ChallengeCustom,
) -> Result<(), AppError> {
    let tasks = parse_task_args(&args.tasks, &args.optional)?;
    let input = ChallengeInput {
        title: Some(args.title),
        color: args.color,
        start_date: args.start,
        with_event: args.with_event,
    };
    let (challenge, event) = app
        .start_custom(input, args.days, tasks, clock.today)
        .await?;
    print_started(&challenge, event.as_ref());
    Ok(())
}

fn print_started(
    challenge: &crate::entities::challenge::Model,
    event: Option<&crate::entities::event::Model>,
) {
    println!(
        "Created challenge ID: {} ({} days from {})",
        challenge.id,
        challenge.duration_days,
        format_date(challenge.start_date)
    );
    if let Some(event) = event {
        println!(
            "Created event ID: {} (version {})",
            event.id, event.lock_version
        );
    }
}

async fn handle_challenge_list(app: &App, args: ChallengeList) -> Result<(), AppError> {
    let status = args.status.map(challenge_status_from_arg);
    let challenges = app.list_challenges(status).await?;
    if challenges.is_empty() {
        println!("No challenges.");
        return Ok(());
    }
    for challenge in challenges {
        println!("{}", format_challenge_line(&challenge));
    }
    Ok(())
}

async fn handle_challenge_toggle(
    app: &App,
    clock: Clock,
    args: ChallengeToggle,
) -> Result<(), AppError> {
    let done = !args.undo;
    let (task, challenge, changes) = app
        .toggle_task(args.id, args.task_id, done, clock.today)
        .await?;
    println!(
        "Task ID: {} marked {}. Challenge ID: {} is on day {}/{} ({}%).",
        task.id,
        if task.is_done { "done" } else { "not done" },
        challenge.id,
        challenge.current_day,
        challenge.duration_days,
        challenge.achievement_rate
    );
    print_progress_changes(&changes);
    summarize_completed(app, &changes).await
}

async fn handle_challenge_log(app: &App, clock: Clock, args: ChallengeLog) -> Result<(), AppError> {
    let input = DailyLogInput {
        review_text: args.review,
        difficulty_score: args.difficulty,
    };
    let log = app
        .save_daily_log(args.id, args.day, clock.today, input)
        .await?;
    println!(
        "Saved log for challenge ID: {} day {} ({}).",
        args.id,
        args.day,
        format_date(log.log_date)
    );
    Ok(())
}

async fn handle_challenge_status(
    app: &App,
    id: i64,
    action: StatusAction,
) -> Result<(), AppError> {
    let (challenge, changes) = app.set_challenge_status(id, action).await?;
    println!("Challenge ID: {} is now {}.", challenge.id, challenge.status);
    print_progress_changes(&changes);
    Ok(())
}

async fn handle_challenge_update(app: &App, args: ChallengeUpdate) -> Result<(), AppError> {
    if args.title.is_none() && args.color.is_none() {
        return Err(AppError::InvalidInput("no challenge changes provided".to_string()));
    }
    let (challenge, changes) = app
        .update_challenge(
            args.id,
            ChallengeChanges {
                title: args.title,
                color: args.color,
            },
        )
        .await?;
    println!("Updated challenge ID: {}.", challenge.id);
    print_progress_changes(&changes);
    Ok(())
}

async fn handle_challenge_export(
    app: &App,
    home: &Path,
    args: ChallengeExport,
) -> Result<(), AppError> {
    let detail = app.get_challenge_detail(args.id).await?;
    let path = args.path.unwrap_or_else(|| {
        db::resolve_export_dir(home).join(format!("challenge-{}.md", detail.challenge.id))
    });
    db::ensure_parent_dir(&path)?;
    fs::write(&path, format_challenge_markdown(&detail))?;
    println!(
        "Exported challenge ID: {} to {}",
        detail.challenge.id,
        path.display()
    );
    Ok(())
}

async fn handle_event(app: &App, clock: Clock, command: EventCommand) -> Result<(), AppError> {
    match command {
        EventCommand::Add(args) => handle_event_add(app, args).await,
        EventCommand::List => {
            let events = app.list_events().await?;
            if events.is_empty() {
                println!("No events.");
            }
            for event in events {
                println!(
                    "{} [{}] {} {} .. {} (version {})",
                    event.id,
                    event.status,
                    event.title,
                    format_datetime(event.start_at),
                    format_datetime(event.end_at),
                    event.lock_version
                );
            }
            Ok(())
        }
        EventCommand::Show(args) => handle_event_show(app, args).await,
        EventCommand::Update(args) => handle_event_update(app, args).await,
        EventCommand::Remove(args) => {
            app.delete_event(args.id).await?;
            println!("Removed event ID: {}", args.id);
            Ok(())
        }
        EventCommand::Invite(args) => handle_event_invite(app, clock, args).await,
        EventCommand::Invitations(args) => {
            let invitations = app.list_invitations(args.id, clock.now).await?;
            if invitations.is_empty() {
                println!("No invitations.");
            }
            for invitation in invitations {
                println!("{}", format_invitation_line(&invitation));
            }
            Ok(())
        }
        EventCommand::Participants(args) => {
            for participant in app.list_participants(args.id).await? {
                println!("{} ({})", participant.user_id, participant.role);
            }
            Ok(())
        }
        EventCommand::Role(args) => handle_event_role(app, args).await,
        EventCommand::RemoveParticipant(args) => {
            let removed = app.remove_participant(args.id, &args.target).await?;
            println!("Removed {} from event ID: {}", removed.user_id, args.id);
            Ok(())
        }
        EventCommand::Leave(args) => {
            let user = app.user_id().to_string();
            app.remove_participant(args.id, &user).await?;
            println!("Left event ID: {}", args.id);
            Ok(())
        }
    }
}

async fn handle_event_add(app: &App, args: EventAdd) -> Result<(), AppError> {
    let event = app
        .create_event(EventInput {
            title: args.title,
            start_at: args.start,
            end_at: args.end,
            event_type: event_type_from_arg(args.event_type),
            description: args.description,
            color: args.color,
        })
        .await?;
    println!(
        "Created event ID: {} (version {})",
        event.id, event.lock_version
    );
    Ok(())
}

async fn handle_event_show(app: &App, args: EventShow) -> Result<(), AppError> {
    let event = app.get_event(args.id).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&event)?);
        return Ok(());
    }
    let participants = app.list_participants(args.id).await?;
    println!("{}", format_event_detail(&event, &participants));
    Ok(())
}

async fn handle_event_update(app: &App, args: EventUpdate) -> Result<(), AppError> {
    let patch = EventPatch {
        title: args.title,
        description: args.description,
        start_at: args.start,
        end_at: args.end,
        color: args.color,
        status: args.status.map(event_status_from_arg),
    };
    let event = app
        .update_event(args.id, args.expected_version, patch)
        .await?;
    println!(
        "Updated event ID: {} (version {})",
        event.id, event.lock_version
    );
    Ok(())
}

async fn handle_event_invite(app: &App, clock: Clock, args: EventInvite) -> Result<(), AppError> {
    let invitation = app
        .invite(args.id, &args.address, role_from_arg(args.role), clock.now)
        .await?;
    println!(
        "Created invitation ID: {} for {} as {}",
        invitation.id, invitation.email, invitation.role
    );
    println!("Token: {}", invitation.token);
    println!("Expires: {}", format_datetime(invitation.expires_at));
    Ok(())
}

async fn handle_event_role(app: &App, args: EventRole) -> Result<(), AppError> {
    let participant = app
        .change_role(args.id, &args.target, role_from_arg(args.role))
        .await?;
    println!(
        "Participant {} on event ID: {} is now {}.",
        participant.user_id, args.id, participant.role
    );
    Ok(())
}

async fn handle_invite(app: &App, clock: Clock, command: InviteCommand) -> Result<(), AppError> {
    match command {
        InviteCommand::Accept(args) => {
            let (invitation, participant) = app.accept_invitation(&args.token, clock.now).await?;
            println!(
                "Joined event ID: {} as {}",
                invitation.event_id, participant.role
            );
        }
        InviteCommand::Decline(args) => {
            let invitation = app.decline_invitation(&args.token, clock.now).await?;
            println!("Declined invitation to event ID: {}", invitation.event_id);
        }
    }
    Ok(())
}

fn print_progress_changes(changes: &ProgressChanges) {
    if changes.is_empty() {
        return;
    }

    println!("Progress updates:");
    for change in &changes.advanced {
        println!(
            "- Challenge ID: {} advanced from day {} to day {} (streak {}).",
            change.challenge_id, change.from_day, change.to_day, change.streak_count
        );
    }
    for change in &changes.completed {
        println!(
            "- Challenge ID: {} completed with {}% achievement.",
            change.challenge_id, change.achievement_rate
        );
    }
    for change in &changes.events_synced {
        println!(
            "- Event ID: {} synced to version {} ({}).",
            change.event_id, change.lock_version, change.reason
        );
    }
}

async fn summarize_completed(app: &App, changes: &ProgressChanges) -> Result<(), AppError> {
    if changes.completed.is_empty() {
        return Ok(());
    }
    let Some(summarizer) = app.summarizer() else {
        return Ok(());
    };
    for change in &changes.completed {
        if app
            .refresh_ai_summary(change.challenge_id, &summarizer)
            .await?
            .is_some()
        {
            println!("Stored summary for challenge ID: {}", change.challenge_id);
        }
    }
    Ok(())
}

fn parse_task_args(required: &[String], optional: &[String]) -> Result<Vec<TaskInput>, AppError> {
    let mut tasks = Vec::with_capacity(required.len() + optional.len());
    for value in required {
        tasks.push(parse_task_arg(value, true)?);
    }
    for value in optional {
        tasks.push(parse_task_arg(value, false)?);
    }
    tasks.sort_by_key(|task| task.day_number);
    Ok(tasks)
}

fn parse_task_arg(value: &str, is_required: bool) -> Result<TaskInput, AppError> {
    let Some((day, title)) = value.split_once(':') else {
        return Err(AppError::InvalidInput(format!(
            "task '{value}' must look like DAY:TITLE"
        )));
    };
    let day_number = day.trim().parse::<i32>().map_err(|_| {
        AppError::InvalidInput(format!("task '{value}' has an invalid day number"))
    })?;
    Ok(TaskInput {
        day_number,
        title: title.trim().to_string(),
        description: None,
        is_required,
    })
}

fn category_from_arg(arg: CategoryArg) -> TemplateCategory {
    match arg {
        CategoryArg::Routine => TemplateCategory::Routine,
        CategoryArg::Study => TemplateCategory::Study,
        CategoryArg::Workout => TemplateCategory::Workout,
        CategoryArg::Custom => TemplateCategory::Custom,
    }
}

fn visibility_from_arg(arg: VisibilityArg) -> TemplateVisibility {
    match arg {
        VisibilityArg::Private => TemplateVisibility::Private,
        VisibilityArg::Public => TemplateVisibility::Public,
        VisibilityArg::Unlisted => TemplateVisibility::Unlisted,
    }
}

fn challenge_status_from_arg(arg: ChallengeStatusArg) -> ChallengeStatus {
    match arg {
        ChallengeStatusArg::Active => ChallengeStatus::Active,
        ChallengeStatusArg::Paused => ChallengeStatus::Paused,
        ChallengeStatusArg::Completed => ChallengeStatus::Completed,
        ChallengeStatusArg::Cancelled => ChallengeStatus::Cancelled,
    }
}

fn event_type_from_arg(arg: EventTypeArg) -> EventType {
    match arg {
        EventTypeArg::Normal => EventType::Normal,
        EventTypeArg::Challenge => EventType::Challenge,
        EventTypeArg::Dday => EventType::Dday,
    }
}

fn event_status_from_arg(arg: EventStatusArg) -> EventStatus {
    match arg {
        EventStatusArg::Scheduled => EventStatus::Scheduled,
        EventStatusArg::Completed => EventStatus::Completed,
        EventStatusArg::Cancelled => EventStatus::Cancelled,
    }
}

fn role_from_arg(arg: RoleArg) -> ParticipantRole {
    match arg {
        RoleArg::Editor => ParticipantRole::Editor,
        RoleArg::Viewer => ParticipantRole::Viewer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_specs_split_on_first_colon() {
        let task = parse_task_arg("3: Read: chapter 2", true).expect("parse");
        assert_eq!(task.day_number, 3);
        assert_eq!(task.title, "Read: chapter 2");
        assert!(task.is_required);
        assert!(parse_task_arg("no day here", true).is_err());
        assert!(parse_task_arg("x:Title", false).is_err());
    }

    #[test]
    fn task_specs_are_ordered_by_day() {
        let tasks = parse_task_args(
            &["2:Run".to_string(), "1:Walk".to_string()],
            &["1:Stretch".to_string()],
        )
        .expect("parse");
        let days: Vec<i32> = tasks.iter().map(|task| task.day_number).collect();
        assert_eq!(days, vec![1, 1, 2]);
        assert_eq!(tasks[0].title, "Walk");
        assert!(!tasks[1].is_required);
    }
}
