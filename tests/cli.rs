use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use serde_json::Value;
use tempfile::TempDir;

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_dayboard"))
}

fn run_as(home: &Path, user: Option<&str>, args: &[&str]) -> Output {
    let mut cmd = Command::new(bin_path());
    cmd.arg("--home").arg(home);
    if let Some(user) = user {
        cmd.arg("--user").arg(user);
    }
    cmd.args(args);
    cmd.env_remove("DAYBOARD_USER")
        .env_remove("DAYBOARD_EMAIL")
        .env_remove("DAYBOARD_LOG");
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.output().expect("run command")
}

fn run_cmd(home: &Path, args: &[&str]) -> Output {
    run_as(home, Some("alice"), args)
}

fn output_stdout(output: Output) -> String {
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("stdout utf8")
}

fn output_stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn parse_created_id(stdout: &str, prefix: &str) -> i64 {
    let line = stdout
        .lines()
        .find(|line| line.starts_with(prefix))
        .unwrap_or_else(|| panic!("missing '{prefix}' in {stdout}"));
    let rest = line.strip_prefix(prefix).expect("prefix");
    rest.split_whitespace()
        .next()
        .expect("id")
        .parse()
        .expect("numeric id")
}

fn task_ids(show: &str) -> Vec<i64> {
    show.lines()
        .filter_map(|line| line.split("(task id ").nth(1))
        .map(|rest| rest.trim_end_matches(')').parse().expect("task id"))
        .collect()
}

fn start_custom(home: &Path, days: &str, tasks: &[&str], extra: &[&str]) -> i64 {
    let mut args = vec!["challenge", "custom", "Morning run", "--days", days, "--start", "2024-01-01"];
    for task in tasks {
        args.push("--task");
        args.push(task);
    }
    args.extend_from_slice(extra);
    let stdout = output_stdout(run_cmd(home, &args));
    parse_created_id(&stdout, "Created challenge ID: ")
}

fn toggle_first_task(home: &Path, challenge_id: i64, today: &str) -> String {
    let id = challenge_id.to_string();
    let show = output_stdout(run_cmd(home, &["--today", today, "challenge", "show", &id]));
    let task_id = task_ids(&show)[0].to_string();
    output_stdout(run_cmd(
        home,
        &["--today", today, "challenge", "toggle", &id, &task_id],
    ))
}

#[test]
fn custom_challenge_advances_day_by_day() {
    let dir = TempDir::new().expect("temp dir");
    let home = dir.path();
    let challenge_id = start_custom(home, "3", &["1:Run 2k", "2:Run 3k", "3:Run 5k"], &[]);
    let id = challenge_id.to_string();

    let stdout = toggle_first_task(home, challenge_id, "2024-01-01");
    assert!(stdout.contains("Progress updates:"), "{stdout}");
    assert!(stdout.contains("advanced from day 1 to day 2 (streak 1)"));

    let show = output_stdout(run_cmd(
        home,
        &["--today", "2024-01-02", "challenge", "show", &id],
    ));
    assert!(show.contains("Day: 2/3 (unlocked 2)"), "{show}");
    assert!(show.contains("Run 3k"));

    toggle_first_task(home, challenge_id, "2024-01-02");
    let stdout = toggle_first_task(home, challenge_id, "2024-01-03");
    assert!(stdout.contains("completed with 100% achievement"), "{stdout}");

    let list = output_stdout(run_cmd(home, &["challenge", "list", "--status", "completed"]));
    assert!(list.contains("[completed] Morning run (day 3/3, streak 3, 100%)"), "{list}");
}

#[test]
fn locked_day_is_reported() {
    let dir = TempDir::new().expect("temp dir");
    let home = dir.path();
    let challenge_id = start_custom(home, "3", &["1:Run", "2:Run", "3:Run"], &[]);
    let id = challenge_id.to_string();

    let show = output_stdout(run_cmd(
        home,
        &["--today", "2024-01-01", "challenge", "show", &id],
    ));
    let day_one = task_ids(&show)[0];
    let day_two = (day_one + 1).to_string();

    let output = run_cmd(
        home,
        &["--today", "2024-01-01", "challenge", "toggle", &id, &day_two],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(output_stderr(&output).contains("Locked day: day 2 is not open (unlocked day is 1)"));
}

#[test]
fn missed_day_requires_retry() {
    let dir = TempDir::new().expect("temp dir");
    let home = dir.path();
    let challenge_id = start_custom(
        home,
        "3",
        &["1:Read", "2:Read", "3:Read"],
        &["--with-event"],
    );
    let id = challenge_id.to_string();
    toggle_first_task(home, challenge_id, "2024-01-01");

    let show = output_stdout(run_cmd(
        home,
        &["--today", "2024-01-04", "challenge", "show", &id],
    ));
    assert!(show.contains("Day 2 was missed"), "{show}");

    let stdout = output_stdout(run_cmd(
        home,
        &["--today", "2024-01-04", "challenge", "retry", &id],
    ));
    assert!(stdout.contains("Restarted challenge ID: 1 on 2024-01-04 (restart #1)."), "{stdout}");
    assert!(stdout.contains("synced to version 2 (challenge restarted)"));

    let show = output_stdout(run_cmd(
        home,
        &["--today", "2024-01-04", "challenge", "show", &id],
    ));
    assert!(show.contains("Day: 1/3 (unlocked 1)"), "{show}");
    assert!(show.contains("Restarts: 1"));
}

#[test]
fn extend_uses_configured_cycles() {
    let dir = TempDir::new().expect("temp dir");
    let home = dir.path();
    fs::write(home.join("config.toml"), "extend_cycles = 2\n").expect("write config");

    let stdout = output_stdout(run_cmd(
        home,
        &[
            "template", "add", "Pair", "--days", "2", "--task", "1:First", "--task", "2:Second",
        ],
    ));
    let template_id = parse_created_id(&stdout, "Created template ID: ").to_string();
    let stdout = output_stdout(run_cmd(
        home,
        &["challenge", "start", &template_id, "--start", "2024-01-01"],
    ));
    let challenge_id = parse_created_id(&stdout, "Created challenge ID: ");
    let id = challenge_id.to_string();

    let output = run_cmd(home, &["challenge", "extend", &id]);
    assert!(!output.status.success());
    assert!(output_stderr(&output).contains("only completed challenges can be extended"));

    toggle_first_task(home, challenge_id, "2024-01-01");
    toggle_first_task(home, challenge_id, "2024-01-02");
    let stdout = output_stdout(run_cmd(home, &["challenge", "extend", &id]));
    assert!(stdout.contains("by 4 days (now 6 days, day 3)"), "{stdout}");
}

#[test]
fn daily_log_and_export() {
    let dir = TempDir::new().expect("temp dir");
    let home = dir.path();
    let challenge_id = start_custom(home, "2", &["1:Write", "2:Write"], &[]);
    let id = challenge_id.to_string();

    let stdout = output_stdout(run_cmd(
        home,
        &[
            "--today",
            "2024-01-01",
            "challenge",
            "log",
            &id,
            "1",
            "--review",
            "Slow start",
            "--difficulty",
            "3",
        ],
    ));
    assert!(stdout.contains("Saved log for challenge ID: 1 day 1 (2024-01-01)."));

    let output = run_cmd(
        home,
        &["--today", "2024-01-01", "challenge", "log", &id, "1", "--difficulty", "9"],
    );
    assert!(!output.status.success());

    let path = home.join("out").join("run.md");
    let path_arg = path.to_string_lossy().to_string();
    output_stdout(run_cmd(home, &["challenge", "export", &id, "--path", &path_arg]));
    let markdown = fs::read_to_string(&path).expect("read export");
    assert!(markdown.starts_with("# Challenge: Morning run"));
    assert!(markdown.contains("### 2024-01-01 (difficulty 3/5)"));
    assert!(markdown.contains("> Slow start"));
}

#[test]
fn stale_event_update_exits_with_conflict() {
    let dir = TempDir::new().expect("temp dir");
    let home = dir.path();
    let stdout = output_stdout(run_cmd(
        home,
        &[
            "event",
            "add",
            "Standup",
            "--start",
            "2024-01-01T09:00:00Z",
            "--end",
            "2024-01-01T09:15:00Z",
        ],
    ));
    assert!(stdout.contains("(version 1)"));
    let event_id = parse_created_id(&stdout, "Created event ID: ").to_string();

    let stdout = output_stdout(run_cmd(
        home,
        &["event", "update", &event_id, "--expected-version", "1", "--title", "Daily"],
    ));
    assert!(stdout.contains("Updated event ID: 1 (version 2)"));

    let output = run_cmd(
        home,
        &["event", "update", &event_id, "--expected-version", "1", "--title", "Weekly"],
    );
    assert_eq!(output.status.code(), Some(2));
    assert!(output_stderr(&output).contains("Version conflict"));
    let current: Value = serde_json::from_slice(&output.stdout).expect("conflict json");
    assert_eq!(current["lock_version"], 2);
    assert_eq!(current["title"], "Daily");
}

#[test]
fn invitation_round_trip_between_users() {
    let dir = TempDir::new().expect("temp dir");
    let home = dir.path();
    let stdout = output_stdout(run_cmd(
        home,
        &[
            "event",
            "add",
            "Trip",
            "--start",
            "2024-01-05T00:00:00Z",
            "--end",
            "2024-01-07T00:00:00Z",
        ],
    ));
    let event_id = parse_created_id(&stdout, "Created event ID: ").to_string();

    let stdout = output_stdout(run_cmd(
        home,
        &[
            "--now",
            "2024-01-01T00:00:00Z",
            "event",
            "invite",
            &event_id,
            "bob@example.com",
            "--role",
            "editor",
        ],
    ));
    let token = stdout
        .lines()
        .find_map(|line| line.strip_prefix("Token: "))
        .expect("token")
        .to_string();
    assert_eq!(token.len(), 64);

    let output = run_as(home, Some("bob"), &["event", "show", &event_id]);
    assert!(output_stderr(&output).contains("Not authorized"));

    let stdout = output_stdout(run_as(
        home,
        Some("bob"),
        &["--now", "2024-01-02T00:00:00Z", "invite", "accept", &token],
    ));
    assert!(stdout.contains("Joined event ID: 1 as editor"));

    let stdout = output_stdout(run_as(
        home,
        Some("bob"),
        &["event", "update", &event_id, "--expected-version", "1", "--color", "#FF0000"],
    ));
    assert!(stdout.contains("(version 2)"));

    let participants = output_stdout(run_cmd(home, &["event", "participants", &event_id]));
    assert!(participants.contains("alice (owner)"));
    assert!(participants.contains("bob (editor)"));

    let stdout = output_stdout(run_as(home, Some("bob"), &["event", "leave", &event_id]));
    assert!(stdout.contains("Left event ID: 1"));
}

#[test]
fn late_acceptance_expires_invitation() {
    let dir = TempDir::new().expect("temp dir");
    let home = dir.path();
    let stdout = output_stdout(run_cmd(
        home,
        &[
            "event",
            "add",
            "Dinner",
            "--start",
            "2024-01-05T18:00:00Z",
            "--end",
            "2024-01-05T20:00:00Z",
        ],
    ));
    let event_id = parse_created_id(&stdout, "Created event ID: ").to_string();
    let stdout = output_stdout(run_cmd(
        home,
        &["--now", "2024-01-01T00:00:00Z", "event", "invite", &event_id, "bob@example.com"],
    ));
    let token = stdout
        .lines()
        .find_map(|line| line.strip_prefix("Token: "))
        .expect("token")
        .to_string();

    let output = run_as(
        home,
        Some("bob"),
        &["--now", "2024-01-09T00:00:00Z", "invite", "accept", &token],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(output_stderr(&output).contains("Expired"));

    let listed = output_stdout(run_cmd(
        home,
        &["--now", "2024-01-01T00:00:00Z", "event", "invitations", &event_id],
    ));
    assert!(listed.contains("[expired] bob@example.com as viewer"), "{listed}");
}

#[test]
fn user_is_required() {
    let dir = TempDir::new().expect("temp dir");
    let output = run_as(dir.path(), None, &["challenge", "list"]);
    assert!(!output.status.success());
    assert!(output_stderr(&output).contains("user is required"));
}

#[test]
fn seeded_templates_are_listed_once() {
    let dir = TempDir::new().expect("temp dir");
    let home = dir.path();
    let stdout = output_stdout(run_cmd(home, &["template", "seed"]));
    assert!(stdout.contains("Seeded 3 system templates."));
    let stdout = output_stdout(run_cmd(home, &["template", "seed"]));
    assert!(stdout.contains("Seeded 0 system templates."));

    let list = output_stdout(run_as(home, Some("bob"), &["template", "list"]));
    assert!(list.contains("7-Day Morning Routine"));
    assert_eq!(list.lines().count(), 4);
}
