use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use sea_orm::sea_query::{Index, IntoIden, IntoTableRef};
use sea_orm::{
    ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, EntityTrait, Schema, Statement,
};
use url::Url;

use crate::entities::{
    challenge, daily_log, day_task, event, event_user, invitation, template, template_day,
};
use crate::error::AppError;

pub fn resolve_db_path(home: &Path) -> PathBuf {
    home.join("dayboard.db")
}

pub fn resolve_export_dir(home: &Path) -> PathBuf {
    home.join("exports")
}

pub fn ensure_parent_dir(path: &Path) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn open_lock(path: &Path) -> Result<fd_lock::RwLock<File>, AppError> {
    let lock_path = path.with_extension("lock");
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?;
    Ok(fd_lock::RwLock::new(file))
}

pub async fn connect(path: &Path) -> Result<DatabaseConnection, AppError> {
    let mut url = Url::from_file_path(path)
        .map_err(|_| AppError::InvalidInput(format!("invalid sqlite path: {}", path.display())))?;
    url.set_query(Some("mode=rwc"));
    let sqlite_url = url.as_str().replacen("file://", "sqlite://", 1);
    Ok(Database::connect(&sqlite_url).await?)
}

pub async fn ensure_schema(db: &DatabaseConnection) -> Result<(), AppError> {
    db.execute(Statement::from_string(
        DatabaseBackend::Sqlite,
        "PRAGMA foreign_keys = ON;",
    ))
    .await?;

    create_table(db, template::Entity).await?;
    create_table(db, template_day::Entity).await?;
    create_table(db, challenge::Entity).await?;
    create_table(db, day_task::Entity).await?;
    create_table(db, daily_log::Entity).await?;
    create_table(db, event::Entity).await?;
    create_table(db, event_user::Entity).await?;
    create_table(db, invitation::Entity).await?;

    create_index(
        db,
        "idx_template_days_slot",
        template_day::Entity,
        [
            template_day::Column::TemplateId,
            template_day::Column::DayNumber,
            template_day::Column::TaskOrder,
        ],
        true,
    )
    .await?;
    create_index(
        db,
        "idx_challenges_user",
        challenge::Entity,
        [challenge::Column::UserId],
        false,
    )
    .await?;
    create_index(
        db,
        "idx_day_tasks_slot",
        day_task::Entity,
        [
            day_task::Column::ChallengeId,
            day_task::Column::DayNumber,
            day_task::Column::TaskOrder,
        ],
        true,
    )
    .await?;
    create_index(
        db,
        "idx_daily_logs_date",
        daily_log::Entity,
        [daily_log::Column::ChallengeId, daily_log::Column::LogDate],
        true,
    )
    .await?;
    create_index(
        db,
        "idx_events_external",
        event::Entity,
        [event::Column::ExternalId],
        true,
    )
    .await?;
    create_index(
        db,
        "idx_events_challenge",
        event::Entity,
        [event::Column::ChallengeId],
        true,
    )
    .await?;
    create_index(
        db,
        "idx_event_users_member",
        event_user::Entity,
        [event_user::Column::EventId, event_user::Column::UserId],
        true,
    )
    .await?;
    create_index(
        db,
        "idx_invitations_token",
        invitation::Entity,
        [invitation::Column::Token],
        true,
    )
    .await?;
    create_index(
        db,
        "idx_invitations_event",
        invitation::Entity,
        [invitation::Column::EventId, invitation::Column::Status],
        false,
    )
    .await?;

    Ok(())
}

async fn create_table<E: EntityTrait>(db: &DatabaseConnection, entity: E) -> Result<(), AppError> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);
    let mut stmt = schema.create_table_from_entity(entity);
    stmt.if_not_exists();
    db.execute(builder.build(&stmt)).await?;
    Ok(())
}

async fn create_index<T, C, I>(
    db: &DatabaseConnection,
    name: &str,
    table: T,
    columns: I,
    unique: bool,
) -> Result<(), AppError>
where
    T: IntoTableRef,
    C: IntoIden,
    I: IntoIterator<Item = C>,
{
    let builder = db.get_database_backend();
    let mut stmt = Index::create();
    stmt.name(name).table(table);
    for column in columns {
        stmt.col(column);
    }
    if unique {
        stmt.unique();
    }
    stmt.if_not_exists();
    db.execute(builder.build(&stmt)).await?;
    Ok(())
}
