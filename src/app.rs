use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection,
    DatabaseTransaction, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};

use crate::config::Settings;
use crate::entities::{challenge, daily_log, day_task, event, template, template_day};
use crate::error::AppError;
use crate::model::{
    ChallengeChanges, ChallengeInput, ChallengeMode, ChallengeStatus, DailyLogInput, EventInput,
    EventPatch, EventStatus, EventType, StatusAction, TaskInput, TemplateCategory, TemplateInput,
    TemplateVisibility,
};
use crate::progress::{date_for_day, Progress, Tallies};

pub struct App {
    pub(crate) db: DatabaseConnection,
    pub(crate) user_id: String,
    pub(crate) email: Option<String>,
    pub(crate) settings: Settings,
}

#[derive(Debug)]
pub struct TemplateDetail {
    pub template: template::Model,
    pub days: Vec<template_day::Model>,
}

#[derive(Debug)]
pub struct ChallengeDetail {
    pub challenge: challenge::Model,
    pub tasks: Vec<day_task::Model>,
    pub logs: Vec<daily_log::Model>,
    pub event: Option<event::Model>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TemplateRemoval {
    Deleted,
    Deactivated,
}

#[derive(Clone, Debug)]
pub struct DayAdvanced {
    pub challenge_id: i64,
    pub from_day: i32,
    pub to_day: i32,
    pub streak_count: i32,
}

#[derive(Clone, Debug)]
pub struct ChallengeCompleted {
    pub challenge_id: i64,
    pub achievement_rate: i32,
}

#[derive(Clone, Debug)]
pub struct EventSynced {
    pub event_id: i64,
    pub lock_version: i32,
    pub reason: String,
}

/// Side effects of a progress operation, surfaced to whoever delivers
/// notifications.
#[derive(Default, Debug)]
pub struct ProgressChanges {
    pub advanced: Vec<DayAdvanced>,
    pub completed: Vec<ChallengeCompleted>,
    pub events_synced: Vec<EventSynced>,
}

impl ProgressChanges {
    pub fn is_empty(&self) -> bool {
        self.advanced.is_empty() && self.completed.is_empty() && self.events_synced.is_empty()
    }
}

struct ChallengeSeed {
    template_id: Option<i64>,
    title: String,
    mode: ChallengeMode,
    duration_days: i32,
    start_date: NaiveDate,
    color: String,
    with_event: bool,
}

impl App {
    pub fn new(
        db: DatabaseConnection,
        user_id: String,
        email: Option<String>,
        settings: Settings,
    ) -> Self {
        Self {
            db,
            user_id,
            email,
            settings,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn create_template(
        &self,
        input: TemplateInput,
        tasks: Vec<TaskInput>,
    ) -> Result<(template::Model, usize), AppError> {
        let txn = self.db.begin().await?;
        let result = insert_template_with_conn(&txn, Some(self.user_id.clone()), false, input, &tasks)
            .await
            .map(|template| (template, tasks.len()));
        finalize_transaction(txn, result).await
    }

    /// Inserts the built-in system templates that are not present yet.
    pub async fn seed_system_templates(&self) -> Result<Vec<template::Model>, AppError> {
        let txn = self.db.begin().await?;
        let result: Result<Vec<template::Model>, AppError> = async {
            let mut created = Vec::new();
            for (input, tasks) in system_templates() {
                let exists = template::Entity::find()
                    .filter(template::Column::IsSystem.eq(true))
                    .filter(template::Column::Title.eq(input.title.as_str()))
                    .count(&txn)
                    .await?;
                if exists > 0 {
                    continue;
                }
                created.push(insert_template_with_conn(&txn, None, true, input, &tasks).await?);
            }
            Ok(created)
        }
        .await;

        finalize_transaction(txn, result).await
    }

    pub async fn list_templates(&self) -> Result<Vec<template::Model>, AppError> {
        Ok(template::Entity::find()
            .filter(template::Column::IsActive.eq(true))
            .filter(
                Condition::any()
                    .add(template::Column::Visibility.eq(TemplateVisibility::Public.as_str()))
                    .add(template::Column::IsSystem.eq(true))
                    .add(template::Column::OwnerId.eq(self.user_id.as_str())),
            )
            .order_by_asc(template::Column::Id)
            .all(&self.db)
            .await?)
    }

    pub async fn get_template_detail(&self, id: i64) -> Result<TemplateDetail, AppError> {
        let template = self.get_visible_template_with_conn(&self.db, id).await?;
        let days = template_days_with_conn(&self.db, id).await?;
        Ok(TemplateDetail { template, days })
    }

    pub async fn delete_template(&self, id: i64) -> Result<TemplateRemoval, AppError> {
        let txn = self.db.begin().await?;
        let result: Result<TemplateRemoval, AppError> = async {
            let template = template::Entity::find_by_id(id)
                .one(&txn)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("template id {id}")))?;
            if template.owner_id.as_deref() != Some(self.user_id.as_str()) {
                return Err(AppError::NotAuthorized(format!(
                    "template id {id} is not owned by {}",
                    self.user_id
                )));
            }

            let references = challenge::Entity::find()
                .filter(challenge::Column::TemplateId.eq(id))
                .count(&txn)
                .await?;
            if references > 0 {
                let mut active: template::ActiveModel = template.into();
                active.is_active = Set(false);
                active.updated_at = Set(Utc::now());
                active.update(&txn).await?;
                return Ok(TemplateRemoval::Deactivated);
            }

            template_day::Entity::delete_many()
                .filter(template_day::Column::TemplateId.eq(id))
                .exec(&txn)
                .await?;
            template::Entity::delete_by_id(id).exec(&txn).await?;
            Ok(TemplateRemoval::Deleted)
        }
        .await;

        finalize_transaction(txn, result).await
    }

    async fn get_visible_template_with_conn<C: ConnectionTrait>(
        &self,
        db: &C,
        id: i64,
    ) -> Result<template::Model, AppError> {
        let template = template::Entity::find_by_id(id)
            .one(db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("template id {id}")))?;
        let owned = template.owner_id.as_deref() == Some(self.user_id.as_str());
        if template.visibility == TemplateVisibility::Private.as_str()
            && !template.is_system
            && !owned
        {
            return Err(AppError::NotAuthorized(format!(
                "template id {id} is private"
            )));
        }
        Ok(template)
    }

    pub async fn start_from_template(
        &self,
        template_id: i64,
        input: ChallengeInput,
        today: NaiveDate,
    ) -> Result<(challenge::Model, Option<event::Model>), AppError> {
        if let Some(title) = input.title.as_deref() {
            ensure_non_empty("challenge title", title)?;
        }

        let txn = self.db.begin().await?;
        let result: Result<(challenge::Model, Option<event::Model>), AppError> = async {
            let template = self.get_visible_template_with_conn(&txn, template_id).await?;
            if !template.is_active {
                return Err(AppError::InvalidState(format!(
                    "template id {template_id} is no longer active"
                )));
            }
            let tasks: Vec<TaskInput> = template_days_with_conn(&txn, template_id)
                .await?
                .into_iter()
                .map(task_input_from_day)
                .collect();

            let seed = ChallengeSeed {
                template_id: Some(template.id),
                title: input.title.unwrap_or_else(|| template.title.clone()),
                mode: ChallengeMode::Template,
                duration_days: template.duration_days,
                start_date: input.start_date.unwrap_or(today),
                color: input
                    .color
                    .unwrap_or_else(|| self.settings.default_color.clone()),
                with_event: input.with_event,
            };
            let created = self.insert_challenge_with_conn(&txn, seed, &tasks).await?;

            template::Entity::update_many()
                .col_expr(
                    template::Column::UsageCount,
                    Expr::col(template::Column::UsageCount).add(1),
                )
                .filter(template::Column::Id.eq(template_id))
                .exec(&txn)
                .await?;

            Ok(created)
        }
        .await;

        finalize_transaction(txn, result).await
    }

    pub async fn start_custom(
        &self,
        input: ChallengeInput,
        duration_days: i32,
        tasks: Vec<TaskInput>,
        today: NaiveDate,
    ) -> Result<(challenge::Model, Option<event::Model>), AppError> {
        let title = input
            .title
            .ok_or_else(|| AppError::InvalidInput("custom challenge requires a title".to_string()))?;
        ensure_non_empty("challenge title", &title)?;
        if tasks.is_empty() {
            return Err(AppError::InvalidInput(
                "custom challenge requires at least one task".to_string(),
            ));
        }
        validate_tasks(duration_days, &tasks)?;

        let txn = self.db.begin().await?;
        let seed = ChallengeSeed {
            template_id: None,
            title,
            mode: ChallengeMode::Custom,
            duration_days,
            start_date: input.start_date.unwrap_or(today),
            color: input
                .color
                .unwrap_or_else(|| self.settings.default_color.clone()),
            with_event: input.with_event,
        };
        let result = self.insert_challenge_with_conn(&txn, seed, &tasks).await;
        finalize_transaction(txn, result).await
    }

    async fn insert_challenge_with_conn(
        &self,
        db: &DatabaseTransaction,
        seed: ChallengeSeed,
        tasks: &[TaskInput],
    ) -> Result<(challenge::Model, Option<event::Model>), AppError> {
        let now = Utc::now();
        let active = challenge::ActiveModel {
            user_id: Set(self.user_id.clone()),
            template_id: Set(seed.template_id),
            title: Set(seed.title),
            mode: Set(seed.mode.as_str().to_string()),
            status: Set(ChallengeStatus::Active.as_str().to_string()),
            start_date: Set(seed.start_date),
            end_date: Set(Some(date_for_day(seed.start_date, seed.duration_days)?)),
            duration_days: Set(seed.duration_days),
            current_day: Set(1),
            streak_count: Set(0),
            achievement_rate: Set(0),
            last_check_date: Set(None),
            restart_count: Set(0),
            extension_count: Set(0),
            review: Set(None),
            ai_summary: Set(None),
            color: Set(seed.color),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };
        let insert = challenge::Entity::insert(active).exec(db).await?;
        let challenge = challenge::Entity::find_by_id(insert.last_insert_id)
            .one(db)
            .await?
            .ok_or_else(|| AppError::NotFound("challenge not found after insert".to_string()))?;

        insert_day_tasks_with_conn(db, challenge.id, 0, tasks).await?;

        let event = if seed.with_event {
            let (start_at, end_at) =
                challenge_window(challenge.start_date, challenge.duration_days)?;
            let event = self
                .insert_event_with_conn(
                    db,
                    EventInput {
                        title: challenge.title.clone(),
                        start_at,
                        end_at,
                        event_type: EventType::Challenge,
                        description: None,
                        color: Some(challenge.color.clone()),
                    },
                    Some(challenge.id),
                )
                .await?;
            Some(event)
        } else {
            None
        };

        tracing::info!(
            challenge_id = challenge.id,
            user = %self.user_id,
            duration_days = challenge.duration_days,
            "challenge started"
        );
        Ok((challenge, event))
    }

    pub async fn get_challenge(&self, id: i64) -> Result<challenge::Model, AppError> {
        self.owned_challenge_with_conn(&self.db, id).await
    }

    pub async fn get_challenge_detail(&self, id: i64) -> Result<ChallengeDetail, AppError> {
        let challenge = self.owned_challenge_with_conn(&self.db, id).await?;
        let tasks = tasks_for_challenge_with_conn(&self.db, id).await?;
        let logs = logs_for_challenge_with_conn(&self.db, id).await?;
        let event = event::Entity::find()
            .filter(event::Column::ChallengeId.eq(id))
            .one(&self.db)
            .await?;
        Ok(ChallengeDetail {
            challenge,
            tasks,
            logs,
            event,
        })
    }

    pub async fn list_challenges(
        &self,
        status: Option<ChallengeStatus>,
    ) -> Result<Vec<challenge::Model>, AppError> {
        let mut select =
            challenge::Entity::find().filter(challenge::Column::UserId.eq(self.user_id.as_str()));
        if let Some(status) = status {
            select = select.filter(challenge::Column::Status.eq(status.as_str()));
        }
        Ok(select
            .order_by_desc(challenge::Column::UpdatedAt)
            .order_by_asc(challenge::Column::Id)
            .all(&self.db)
            .await?)
    }

    pub async fn list_daily_logs(&self, id: i64) -> Result<Vec<daily_log::Model>, AppError> {
        self.owned_challenge_with_conn(&self.db, id).await?;
        logs_for_challenge_with_conn(&self.db, id).await
    }

    /// Whether the user fell behind and must explicitly restart.
    pub async fn can_retry(&self, id: i64, today: NaiveDate) -> Result<bool, AppError> {
        let challenge = self.owned_challenge_with_conn(&self.db, id).await?;
        let status: ChallengeStatus = challenge.status.parse()?;
        let tasks = tasks_for_challenge_with_conn(&self.db, id).await?;
        Ok(Progress::of(&challenge, status).can_retry(today, &Tallies::from_tasks(&tasks)))
    }

    pub async fn toggle_task(
        &self,
        challenge_id: i64,
        task_id: i64,
        done: bool,
        today: NaiveDate,
    ) -> Result<(day_task::Model, challenge::Model, ProgressChanges), AppError> {
        let txn = self.db.begin().await?;
        let result = self
            .toggle_task_with_conn(&txn, challenge_id, task_id, done, today)
            .await;
        finalize_transaction(txn, result).await
    }

    async fn toggle_task_with_conn(
        &self,
        db: &DatabaseTransaction,
        challenge_id: i64,
        task_id: i64,
        done: bool,
        today: NaiveDate,
    ) -> Result<(day_task::Model, challenge::Model, ProgressChanges), AppError> {
        let challenge = self.owned_challenge_with_conn(db, challenge_id).await?;
        let status: ChallengeStatus = challenge.status.parse()?;
        if status != ChallengeStatus::Active {
            return Err(AppError::InvalidState(format!(
                "challenge id {challenge_id} is {}; only active challenges accept task updates",
                challenge.status
            )));
        }

        let task = day_task::Entity::find_by_id(task_id)
            .filter(day_task::Column::ChallengeId.eq(challenge_id))
            .one(db)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("task id {task_id} in challenge id {challenge_id}"))
            })?;

        let progress = Progress::of(&challenge, status);
        let unlocked = progress.unlocked_day(today);
        if task.day_number != unlocked {
            return Err(AppError::LockedDay {
                day: task.day_number,
                unlocked,
            });
        }
        if task.is_done == done {
            return Ok((task, challenge, ProgressChanges::default()));
        }

        let now = Utc::now();
        let day_number = task.day_number;
        let mut task_active: day_task::ActiveModel = task.into();
        task_active.is_done = Set(done);
        task_active.done_at = Set(done.then_some(now));
        task_active.updated_at = Set(now);
        let task = task_active.update(db).await?;

        let tasks = tasks_for_challenge_with_conn(db, challenge_id).await?;
        let tallies = Tallies::from_tasks(&tasks);

        let mut changes = ProgressChanges::default();
        let mut completed = false;
        let mut active: challenge::ActiveModel = challenge.clone().into();
        active.achievement_rate = Set(tallies.achievement_rate());
        // The last day keeps its number after advancing, so a re-toggle on the
        // same date must not advance it again.
        let already_advanced = challenge.last_check_date == Some(today);
        if tallies.day(day_number).is_complete()
            && day_number == challenge.current_day
            && !already_advanced
        {
            let advance = progress.advance(today, &tallies);
            active.current_day = Set(advance.current_day);
            active.streak_count = Set(advance.streak_count);
            active.last_check_date = Set(Some(advance.last_check_date));
            active.achievement_rate = Set(advance.achievement_rate);
            changes.advanced.push(DayAdvanced {
                challenge_id,
                from_day: challenge.current_day,
                to_day: advance.current_day,
                streak_count: advance.streak_count,
            });
            tracing::info!(
                challenge_id,
                from_day = challenge.current_day,
                to_day = advance.current_day,
                streak = advance.streak_count,
                "challenge day advanced"
            );
            if advance.completed {
                completed = true;
                active.status = Set(ChallengeStatus::Completed.as_str().to_string());
                changes.completed.push(ChallengeCompleted {
                    challenge_id,
                    achievement_rate: advance.achievement_rate,
                });
                tracing::info!(
                    challenge_id,
                    rate = advance.achievement_rate,
                    "challenge completed"
                );
            }
        }
        active.updated_at = Set(now);
        let challenge = active.update(db).await?;

        if completed {
            let synced = self
                .sync_challenge_event_with_conn(
                    db,
                    challenge_id,
                    EventPatch {
                        status: Some(EventStatus::Completed),
                        ..Default::default()
                    },
                    "challenge completed",
                )
                .await?;
            changes.events_synced.extend(synced);
        }

        Ok((task, challenge, changes))
    }

    pub async fn retry(
        &self,
        challenge_id: i64,
        today: NaiveDate,
    ) -> Result<(challenge::Model, ProgressChanges), AppError> {
        let txn = self.db.begin().await?;
        let result: Result<(challenge::Model, ProgressChanges), AppError> = async {
            let challenge = self.owned_challenge_with_conn(&txn, challenge_id).await?;
            let status: ChallengeStatus = challenge.status.parse()?;
            let tasks = tasks_for_challenge_with_conn(&txn, challenge_id).await?;
            let progress = Progress::of(&challenge, status);
            if !progress.can_retry(today, &Tallies::from_tasks(&tasks)) {
                return Err(AppError::InvalidState(format!(
                    "challenge id {challenge_id} cannot be retried (status {}, current day {}, unlocked day {})",
                    challenge.status,
                    challenge.current_day,
                    progress.unlocked_day(today)
                )));
            }

            let now = Utc::now();
            // Daily logs are narrative history keyed by date; a retry leaves them alone.
            day_task::Entity::update_many()
                .col_expr(day_task::Column::IsDone, Expr::value(false))
                .col_expr(day_task::Column::DoneAt, Expr::value(None::<DateTime<Utc>>))
                .col_expr(day_task::Column::UpdatedAt, Expr::value(now))
                .filter(day_task::Column::ChallengeId.eq(challenge_id))
                .exec(&txn)
                .await?;

            let restart_count = challenge.restart_count + 1;
            let duration_days = challenge.duration_days;
            let mut active: challenge::ActiveModel = challenge.into();
            active.current_day = Set(1);
            active.streak_count = Set(0);
            active.achievement_rate = Set(0);
            active.start_date = Set(today);
            active.end_date = Set(Some(date_for_day(today, duration_days)?));
            active.restart_count = Set(restart_count);
            active.updated_at = Set(now);
            let challenge = active.update(&txn).await?;
            tracing::info!(challenge_id, restart_count, "challenge restarted");

            let (start_at, end_at) = challenge_window(today, duration_days)?;
            let mut changes = ProgressChanges::default();
            let synced = self
                .sync_challenge_event_with_conn(
                    &txn,
                    challenge_id,
                    EventPatch {
                        start_at: Some(start_at),
                        end_at: Some(end_at),
                        ..Default::default()
                    },
                    "challenge restarted",
                )
                .await?;
            changes.events_synced.extend(synced);
            Ok((challenge, changes))
        }
        .await;

        finalize_transaction(txn, result).await
    }

    /// Appends `extend_cycles` full template cycles to a completed challenge
    /// and reopens it on the first appended day.
    pub async fn extend(
        &self,
        challenge_id: i64,
    ) -> Result<(challenge::Model, i32, ProgressChanges), AppError> {
        let txn = self.db.begin().await?;
        let result: Result<(challenge::Model, i32, ProgressChanges), AppError> = async {
            let challenge = self.owned_challenge_with_conn(&txn, challenge_id).await?;
            if challenge.status != ChallengeStatus::Completed.as_str() {
                return Err(AppError::InvalidState(format!(
                    "challenge id {challenge_id} is {}; only completed challenges can be extended",
                    challenge.status
                )));
            }
            let Some(template_id) = challenge.template_id else {
                return Err(AppError::InvalidState(format!(
                    "challenge id {challenge_id} was not started from a template"
                )));
            };
            let template = template::Entity::find_by_id(template_id)
                .one(&txn)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("template id {template_id}")))?;
            let days: Vec<TaskInput> = template_days_with_conn(&txn, template_id)
                .await?
                .into_iter()
                .map(task_input_from_day)
                .collect();
            if days.is_empty() {
                return Err(AppError::InvalidState(format!(
                    "template id {template_id} has no days to append"
                )));
            }

            let previous_duration = challenge.duration_days;
            let cycles = i32::try_from(self.settings.extend_cycles).unwrap_or(i32::MAX);
            let duration_days = cycles
                .checked_mul(template.duration_days)
                .and_then(|appended| previous_duration.checked_add(appended))
                .ok_or_else(|| {
                    AppError::InvalidInput(format!(
                        "extending challenge id {challenge_id} by {cycles} cycles overflows its duration"
                    ))
                })?;
            let appended = duration_days - previous_duration;
            let start_date = challenge.start_date;
            let end_date = date_for_day(start_date, duration_days)?;
            for cycle in 0..cycles {
                let offset = previous_duration + cycle * template.duration_days;
                insert_day_tasks_with_conn(&txn, challenge_id, offset, &days).await?;
            }
            let extension_count = challenge.extension_count + 1;

            let mut active: challenge::ActiveModel = challenge.into();
            active.duration_days = Set(duration_days);
            active.current_day = Set(previous_duration + 1);
            active.status = Set(ChallengeStatus::Active.as_str().to_string());
            active.extension_count = Set(extension_count);
            active.end_date = Set(Some(end_date));
            active.updated_at = Set(Utc::now());
            let challenge = active.update(&txn).await?;
            tracing::info!(challenge_id, appended, duration_days, "challenge extended");

            let (_, end_at) = challenge_window(start_date, duration_days)?;
            let mut changes = ProgressChanges::default();
            let synced = self
                .sync_challenge_event_with_conn(
                    &txn,
                    challenge_id,
                    EventPatch {
                        end_at: Some(end_at),
                        status: Some(EventStatus::Scheduled),
                        ..Default::default()
                    },
                    "challenge extended",
                )
                .await?;
            changes.events_synced.extend(synced);
            Ok((challenge, appended, changes))
        }
        .await;

        finalize_transaction(txn, result).await
    }

    pub async fn save_daily_log(
        &self,
        challenge_id: i64,
        day_number: i32,
        today: NaiveDate,
        input: DailyLogInput,
    ) -> Result<daily_log::Model, AppError> {
        if day_number < 1 {
            return Err(AppError::InvalidInput(format!(
                "day number must be at least 1, got {day_number}"
            )));
        }
        if let Some(score) = input.difficulty_score {
            if !(1..=5).contains(&score) {
                return Err(AppError::InvalidInput(format!(
                    "difficulty score must be between 1 and 5, got {score}"
                )));
            }
        }
        let review_text = input
            .review_text
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());

        let txn = self.db.begin().await?;
        let result: Result<daily_log::Model, AppError> = async {
            let challenge = self.owned_challenge_with_conn(&txn, challenge_id).await?;
            let status: ChallengeStatus = challenge.status.parse()?;
            if status == ChallengeStatus::Cancelled {
                return Err(AppError::InvalidState(format!(
                    "challenge id {challenge_id} is cancelled"
                )));
            }
            let unlocked = Progress::of(&challenge, status).unlocked_day(today);
            if day_number > unlocked {
                return Err(AppError::LockedDay {
                    day: day_number,
                    unlocked,
                });
            }

            let now = Utc::now();
            let log_date = date_for_day(challenge.start_date, day_number)?;
            let existing = daily_log::Entity::find()
                .filter(daily_log::Column::ChallengeId.eq(challenge_id))
                .filter(daily_log::Column::LogDate.eq(log_date))
                .one(&txn)
                .await?;
            let log = match existing {
                Some(log) => {
                    let mut active: daily_log::ActiveModel = log.into();
                    active.review_text = Set(review_text.clone());
                    active.difficulty_score = Set(input.difficulty_score);
                    active.updated_at = Set(now);
                    active.update(&txn).await?
                }
                None => {
                    let active = daily_log::ActiveModel {
                        challenge_id: Set(challenge_id),
                        log_date: Set(log_date),
                        review_text: Set(review_text.clone()),
                        difficulty_score: Set(input.difficulty_score),
                        created_at: Set(now),
                        updated_at: Set(now),
                        ..Default::default()
                    };
                    let insert = daily_log::Entity::insert(active).exec(&txn).await?;
                    daily_log::Entity::find_by_id(insert.last_insert_id)
                        .one(&txn)
                        .await?
                        .ok_or_else(|| {
                            AppError::NotFound("daily log not found after insert".to_string())
                        })?
                }
            };

            if review_text.is_some() {
                let mut active: challenge::ActiveModel = challenge.into();
                active.review = Set(review_text);
                active.updated_at = Set(now);
                active.update(&txn).await?;
            }
            Ok(log)
        }
        .await;

        finalize_transaction(txn, result).await
    }

    pub async fn update_challenge(
        &self,
        challenge_id: i64,
        changes: ChallengeChanges,
    ) -> Result<(challenge::Model, ProgressChanges), AppError> {
        if let Some(title) = changes.title.as_deref() {
            ensure_non_empty("challenge title", title)?;
        }
        if let Some(color) = changes.color.as_deref() {
            ensure_non_empty("challenge color", color)?;
        }

        let txn = self.db.begin().await?;
        let result: Result<(challenge::Model, ProgressChanges), AppError> = async {
            let challenge = self.owned_challenge_with_conn(&txn, challenge_id).await?;
            let mut active: challenge::ActiveModel = challenge.into();
            if let Some(title) = changes.title.clone() {
                active.title = Set(title);
            }
            if let Some(color) = changes.color.clone() {
                active.color = Set(color);
            }
            active.updated_at = Set(Utc::now());
            let challenge = active.update(&txn).await?;

            let mut progress = ProgressChanges::default();
            if changes.title.is_some() || changes.color.is_some() {
                let synced = self
                    .sync_challenge_event_with_conn(
                        &txn,
                        challenge_id,
                        EventPatch {
                            title: changes.title,
                            color: changes.color,
                            ..Default::default()
                        },
                        "challenge details changed",
                    )
                    .await?;
                progress.events_synced.extend(synced);
            }
            Ok((challenge, progress))
        }
        .await;

        finalize_transaction(txn, result).await
    }

    pub async fn set_challenge_status(
        &self,
        challenge_id: i64,
        action: StatusAction,
    ) -> Result<(challenge::Model, ProgressChanges), AppError> {
        let txn = self.db.begin().await?;
        let result: Result<(challenge::Model, ProgressChanges), AppError> = async {
            let challenge = self.owned_challenge_with_conn(&txn, challenge_id).await?;
            let status: ChallengeStatus = challenge.status.parse()?;
            let next = match (status, action) {
                (ChallengeStatus::Active, StatusAction::Pause) => ChallengeStatus::Paused,
                (ChallengeStatus::Paused, StatusAction::Resume) => ChallengeStatus::Active,
                (ChallengeStatus::Active | ChallengeStatus::Paused, StatusAction::Cancel) => {
                    ChallengeStatus::Cancelled
                }
                (status, action) => {
                    return Err(AppError::InvalidState(format!(
                        "challenge id {challenge_id} is {}; cannot {action:?}",
                        status.as_str()
                    )));
                }
            };

            let mut active: challenge::ActiveModel = challenge.into();
            active.status = Set(next.as_str().to_string());
            active.updated_at = Set(Utc::now());
            let challenge = active.update(&txn).await?;

            let mut changes = ProgressChanges::default();
            if next == ChallengeStatus::Cancelled {
                let synced = self
                    .sync_challenge_event_with_conn(
                        &txn,
                        challenge_id,
                        EventPatch {
                            status: Some(EventStatus::Cancelled),
                            ..Default::default()
                        },
                        "challenge cancelled",
                    )
                    .await?;
                changes.events_synced.extend(synced);
            }
            Ok((challenge, changes))
        }
        .await;

        finalize_transaction(txn, result).await
    }

    pub async fn set_ai_summary(
        &self,
        challenge_id: i64,
        summary: String,
    ) -> Result<challenge::Model, AppError> {
        let challenge = self.owned_challenge_with_conn(&self.db, challenge_id).await?;
        if challenge.status != ChallengeStatus::Completed.as_str() {
            return Err(AppError::InvalidState(format!(
                "challenge id {challenge_id} is {}; summaries are stored after completion",
                challenge.status
            )));
        }
        let mut active: challenge::ActiveModel = challenge.into();
        active.ai_summary = Set(Some(summary));
        active.updated_at = Set(Utc::now());
        Ok(active.update(&self.db).await?)
    }

    pub(crate) async fn owned_challenge_with_conn<C: ConnectionTrait>(
        &self,
        db: &C,
        id: i64,
    ) -> Result<challenge::Model, AppError> {
        let challenge = challenge::Entity::find_by_id(id)
            .one(db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("challenge id {id}")))?;
        if challenge.user_id != self.user_id {
            return Err(AppError::NotAuthorized(format!(
                "challenge id {id} belongs to another user"
            )));
        }
        Ok(challenge)
    }

    /// Pushes challenge-driven changes to the bound Event through the
    /// version-checked update path.
    async fn sync_challenge_event_with_conn<C: ConnectionTrait>(
        &self,
        db: &C,
        challenge_id: i64,
        patch: EventPatch,
        reason: &str,
    ) -> Result<Option<EventSynced>, AppError> {
        let Some(bound) = event::Entity::find()
            .filter(event::Column::ChallengeId.eq(challenge_id))
            .one(db)
            .await?
        else {
            return Ok(None);
        };
        let updated = self
            .apply_event_update_with_conn(db, bound.id, bound.lock_version, patch)
            .await?;
        Ok(Some(EventSynced {
            event_id: updated.id,
            lock_version: updated.lock_version,
            reason: reason.to_string(),
        }))
    }
}

/// All-day window of a challenge cycle: midnight of the first day up to
/// midnight after the last day, in UTC.
pub(crate) fn challenge_window(
    start_date: NaiveDate,
    duration_days: i32,
) -> Result<(DateTime<Utc>, DateTime<Utc>), AppError> {
    let start = start_date.and_time(NaiveTime::MIN).and_utc();
    let end = date_for_day(start_date, duration_days.saturating_add(1))?
        .and_time(NaiveTime::MIN)
        .and_utc();
    Ok((start, end))
}

async fn insert_template_with_conn<C: ConnectionTrait>(
    db: &C,
    owner_id: Option<String>,
    is_system: bool,
    input: TemplateInput,
    tasks: &[TaskInput],
) -> Result<template::Model, AppError> {
    ensure_non_empty("template title", &input.title)?;
    validate_tasks(input.duration_days, tasks)?;

    let now = Utc::now();
    let active = template::ActiveModel {
        owner_id: Set(owner_id),
        title: Set(input.title),
        description: Set(input.description),
        category: Set(input.category.as_str().to_string()),
        duration_days: Set(input.duration_days),
        visibility: Set(input.visibility.as_str().to_string()),
        is_system: Set(is_system),
        is_active: Set(true),
        usage_count: Set(0),
        like_count: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    let insert = template::Entity::insert(active).exec(db).await?;
    let template = template::Entity::find_by_id(insert.last_insert_id)
        .one(db)
        .await?
        .ok_or_else(|| AppError::NotFound("template not found after insert".to_string()))?;

    let mut orders: HashMap<i32, i32> = HashMap::new();
    for task in tasks {
        let order = orders.entry(task.day_number).or_insert(0);
        *order += 1;
        let active = template_day::ActiveModel {
            template_id: Set(template.id),
            day_number: Set(task.day_number),
            task_order: Set(*order),
            title: Set(task.title.clone()),
            description: Set(task.description.clone()),
            is_required: Set(task.is_required),
            ..Default::default()
        };
        template_day::Entity::insert(active).exec(db).await?;
    }
    Ok(template)
}

async fn insert_day_tasks_with_conn<C: ConnectionTrait>(
    db: &C,
    challenge_id: i64,
    day_offset: i32,
    tasks: &[TaskInput],
) -> Result<usize, AppError> {
    let now = Utc::now();
    let mut orders: HashMap<i32, i32> = HashMap::new();
    for task in tasks {
        let day_number = day_offset + task.day_number;
        let order = orders.entry(day_number).or_insert(0);
        *order += 1;
        let active = day_task::ActiveModel {
            challenge_id: Set(challenge_id),
            day_number: Set(day_number),
            task_order: Set(*order),
            title: Set(task.title.clone()),
            description: Set(task.description.clone()),
            is_required: Set(task.is_required),
            is_done: Set(false),
            done_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };
        day_task::Entity::insert(active).exec(db).await?;
    }
    Ok(tasks.len())
}

async fn template_days_with_conn<C: ConnectionTrait>(
    db: &C,
    template_id: i64,
) -> Result<Vec<template_day::Model>, AppError> {
    Ok(template_day::Entity::find()
        .filter(template_day::Column::TemplateId.eq(template_id))
        .order_by_asc(template_day::Column::DayNumber)
        .order_by_asc(template_day::Column::TaskOrder)
        .all(db)
        .await?)
}

pub(crate) async fn tasks_for_challenge_with_conn<C: ConnectionTrait>(
    db: &C,
    challenge_id: i64,
) -> Result<Vec<day_task::Model>, AppError> {
    Ok(day_task::Entity::find()
        .filter(day_task::Column::ChallengeId.eq(challenge_id))
        .order_by_asc(day_task::Column::DayNumber)
        .order_by_asc(day_task::Column::TaskOrder)
        .all(db)
        .await?)
}

async fn logs_for_challenge_with_conn<C: ConnectionTrait>(
    db: &C,
    challenge_id: i64,
) -> Result<Vec<daily_log::Model>, AppError> {
    Ok(daily_log::Entity::find()
        .filter(daily_log::Column::ChallengeId.eq(challenge_id))
        .order_by_asc(daily_log::Column::LogDate)
        .all(db)
        .await?)
}

fn task_input_from_day(day: template_day::Model) -> TaskInput {
    TaskInput {
        day_number: day.day_number,
        title: day.title,
        description: day.description,
        is_required: day.is_required,
    }
}

fn validate_tasks(duration_days: i32, tasks: &[TaskInput]) -> Result<(), AppError> {
    if duration_days < 1 {
        return Err(AppError::InvalidInput(format!(
            "duration must be at least 1 day, got {duration_days}"
        )));
    }
    for task in tasks {
        ensure_non_empty("task title", &task.title)?;
        if task.day_number < 1 || task.day_number > duration_days {
            return Err(AppError::InvalidInput(format!(
                "task '{}' is on day {} outside 1..={duration_days}",
                task.title, task.day_number
            )));
        }
    }
    Ok(())
}

fn system_templates() -> Vec<(TemplateInput, Vec<TaskInput>)> {
    let routine = (1..=7)
        .flat_map(|day| {
            [
                required_task(day, "Wake up before 7:00"),
                required_task(day, "Drink a glass of water"),
                optional_task(day, "Stretch for 10 minutes"),
            ]
        })
        .collect();
    let reading = (1..=14)
        .flat_map(|day| {
            [
                required_task(day, "Read 20 pages"),
                optional_task(day, "Write a one-line takeaway"),
            ]
        })
        .collect();
    let pushups = (1..=30)
        .map(|day| required_task(day, &format!("Do {} push-ups", 10 + day)))
        .collect();

    vec![
        (
            system_template_input("7-Day Morning Routine", TemplateCategory::Routine, 7),
            routine,
        ),
        (
            system_template_input("14-Day Reading Habit", TemplateCategory::Study, 14),
            reading,
        ),
        (
            system_template_input("30-Day Push-up Ladder", TemplateCategory::Workout, 30),
            pushups,
        ),
    ]
}

fn system_template_input(title: &str, category: TemplateCategory, days: i32) -> TemplateInput {
    TemplateInput {
        title: title.to_string(),
        description: None,
        category,
        duration_days: days,
        visibility: TemplateVisibility::Public,
    }
}

fn required_task(day_number: i32, title: &str) -> TaskInput {
    TaskInput {
        day_number,
        title: title.to_string(),
        description: None,
        is_required: true,
    }
}

fn optional_task(day_number: i32, title: &str) -> TaskInput {
    TaskInput {
        is_required: false,
        ..required_task(day_number, title)
    }
}

pub(crate) async fn finalize_transaction<T>(
    txn: DatabaseTransaction,
    result: Result<T, AppError>,
) -> Result<T, AppError> {
    match result {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = txn.rollback().await {
                return Err(rollback_err.into());
            }
            Err(err)
        }
    }
}

pub(crate) fn ensure_non_empty(label: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::InvalidInput(format!("{label} cannot be empty")));
    }
    Ok(())
}
