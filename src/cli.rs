use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "dayboard",
    version,
    about = "Run day-by-day challenges and share their calendar events"
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Data directory holding dayboard.db and config.toml"
    )]
    pub home: Option<PathBuf>,
    #[arg(long, global = true, value_name = "ID", help = "Acting user identifier")]
    pub user: Option<String>,
    #[arg(
        long,
        global = true,
        value_name = "EMAIL",
        help = "Email recorded when the acting user joins or creates events"
    )]
    pub email: Option<String>,
    #[arg(
        long,
        global = true,
        value_name = "RFC3339",
        help = "Override the current instant"
    )]
    pub now: Option<DateTime<Utc>>,
    #[arg(
        long,
        global = true,
        value_name = "DATE",
        help = "Override today's date (YYYY-MM-DD) in the configured timezone"
    )]
    pub today: Option<NaiveDate>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(subcommand)]
    Template(TemplateCommand),
    #[command(subcommand)]
    Challenge(ChallengeCommand),
    #[command(subcommand)]
    Event(EventCommand),
    #[command(subcommand)]
    Invite(InviteCommand),
}

#[derive(Subcommand, Debug)]
pub enum TemplateCommand {
    Add(TemplateAdd),
    List,
    Show(TemplateShow),
    Remove(TemplateRemove),
    Seed,
}

#[derive(Subcommand, Debug)]
pub enum ChallengeCommand {
    Start(ChallengeStart),
    Custom(ChallengeCustom),
    List(ChallengeList),
    Show(ChallengeShow),
    Toggle(ChallengeToggle),
    Retry(ChallengeId),
    Extend(ChallengeId),
    Log(ChallengeLog),
    Logs(ChallengeId),
    Pause(ChallengeId),
    Resume(ChallengeId),
    Cancel(ChallengeId),
    Update(ChallengeUpdate),
    Export(ChallengeExport),
    Summarize(ChallengeId),
}

#[derive(Subcommand, Debug)]
pub enum EventCommand {
    Add(EventAdd),
    List,
    Show(EventShow),
    Update(EventUpdate),
    Remove(EventId),
    Invite(EventInvite),
    Invitations(EventId),
    Participants(EventId),
    Role(EventRole),
    #[command(name = "remove-participant")]
    RemoveParticipant(EventParticipant),
    Leave(EventId),
}

#[derive(Subcommand, Debug)]
pub enum InviteCommand {
    Accept(InviteToken),
    Decline(InviteToken),
}

#[derive(Args, Debug)]
pub struct TemplateAdd {
    pub title: String,
    #[arg(long)]
    pub days: i32,
    #[arg(long, value_enum, default_value = "custom")]
    pub category: CategoryArg,
    #[arg(long, value_enum, default_value = "private")]
    pub visibility: VisibilityArg,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long = "task", value_name = "DAY:TITLE", help = "Required task for a day")]
    pub tasks: Vec<String>,
    #[arg(long = "optional", value_name = "DAY:TITLE", help = "Optional task for a day")]
    pub optional: Vec<String>,
}

#[derive(Args, Debug)]
pub struct TemplateShow {
    pub id: i64,
}

#[derive(Args, Debug)]
pub struct TemplateRemove {
    pub id: i64,
}

#[derive(Args, Debug)]
pub struct ChallengeStart {
    pub template_id: i64,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub color: Option<String>,
    #[arg(long, value_name = "DATE")]
    pub start: Option<NaiveDate>,
    #[arg(long, help = "Create a calendar event bound to the challenge")]
    pub with_event: bool,
}

#[derive(Args, Debug)]
pub struct ChallengeCustom {
    pub title: String,
    #[arg(long)]
    pub days: i32,
    #[arg(long = "task", value_name = "DAY:TITLE", help = "Required task for a day")]
    pub tasks: Vec<String>,
    #[arg(long = "optional", value_name = "DAY:TITLE", help = "Optional task for a day")]
    pub optional: Vec<String>,
    #[arg(long)]
    pub color: Option<String>,
    #[arg(long, value_name = "DATE")]
    pub start: Option<NaiveDate>,
    #[arg(long, help = "Create a calendar event bound to the challenge")]
    pub with_event: bool,
}

#[derive(Args, Debug)]
pub struct ChallengeList {
    #[arg(long, value_enum)]
    pub status: Option<ChallengeStatusArg>,
}

#[derive(Args, Debug)]
pub struct ChallengeShow {
    pub id: i64,
}

#[derive(Args, Debug)]
pub struct ChallengeId {
    pub id: i64,
}

#[derive(Args, Debug)]
pub struct ChallengeToggle {
    pub id: i64,
    pub task_id: i64,
    #[arg(long, help = "Mark the task as not done")]
    pub undo: bool,
}

#[derive(Args, Debug)]
pub struct ChallengeLog {
    pub id: i64,
    pub day: i32,
    #[arg(long)]
    pub review: Option<String>,
    #[arg(long, value_name = "1-5")]
    pub difficulty: Option<i32>,
}

#[derive(Args, Debug)]
pub struct ChallengeUpdate {
    pub id: i64,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub color: Option<String>,
}

#[derive(Args, Debug)]
pub struct ChallengeExport {
    pub id: i64,
    #[arg(long, value_name = "PATH")]
    pub path: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct EventAdd {
    pub title: String,
    #[arg(long, value_name = "RFC3339")]
    pub start: DateTime<Utc>,
    #[arg(long, value_name = "RFC3339")]
    pub end: DateTime<Utc>,
    #[arg(long = "type", value_enum, default_value = "normal")]
    pub event_type: EventTypeArg,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long)]
    pub color: Option<String>,
}

#[derive(Args, Debug)]
pub struct EventId {
    pub id: i64,
}

#[derive(Args, Debug)]
pub struct EventShow {
    pub id: i64,
    #[arg(long, help = "Print the event as JSON")]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct EventUpdate {
    pub id: i64,
    #[arg(long, value_name = "VERSION")]
    pub expected_version: i32,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long, value_name = "RFC3339")]
    pub start: Option<DateTime<Utc>>,
    #[arg(long, value_name = "RFC3339")]
    pub end: Option<DateTime<Utc>>,
    #[arg(long)]
    pub color: Option<String>,
    #[arg(long, value_enum)]
    pub status: Option<EventStatusArg>,
}

#[derive(Args, Debug)]
pub struct EventInvite {
    pub id: i64,
    #[arg(value_name = "EMAIL")]
    pub address: String,
    #[arg(long, value_enum, default_value = "viewer")]
    pub role: RoleArg,
}

#[derive(Args, Debug)]
pub struct EventRole {
    pub id: i64,
    #[arg(value_name = "USER")]
    pub target: String,
    #[arg(value_enum)]
    pub role: RoleArg,
}

#[derive(Args, Debug)]
pub struct EventParticipant {
    pub id: i64,
    #[arg(value_name = "USER")]
    pub target: String,
}

#[derive(Args, Debug)]
pub struct InviteToken {
    pub token: String,
}

#[derive(ValueEnum, Clone, Debug)]
pub enum CategoryArg {
    Routine,
    Study,
    Workout,
    Custom,
}

#[derive(ValueEnum, Clone, Debug)]
pub enum VisibilityArg {
    Private,
    Public,
    Unlisted,
}

#[derive(ValueEnum, Clone, Debug)]
pub enum ChallengeStatusArg {
    Active,
    Paused,
    Completed,
    Cancelled,
}

#[derive(ValueEnum, Clone, Debug)]
pub enum EventTypeArg {
    Normal,
    Challenge,
    Dday,
}

#[derive(ValueEnum, Clone, Debug)]
pub enum EventStatusArg {
    Scheduled,
    Completed,
    Cancelled,
}

#[derive(ValueEnum, Clone, Debug)]
pub enum RoleArg {
    Editor,
    Viewer,
}
