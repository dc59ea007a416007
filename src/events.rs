//! Events guarded by a `lock_version` token.
//!
//! Every write to an Event row, whether it comes from a collaborator or from
//! a challenge syncing its dates and color, goes through
//! [`App::apply_event_update_with_conn`]. That function issues a single
//! conditional `UPDATE ... WHERE lock_version = expected` so the version check
//! and the write cannot be separated by another writer.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::app::{ensure_non_empty, finalize_transaction, App};
use crate::entities::{event, event_user, invitation};
use crate::error::AppError;
use crate::model::{EventInput, EventPatch, EventStatus, ParticipantRole};

impl App {
    pub async fn create_event(&self, input: EventInput) -> Result<event::Model, AppError> {
        let txn = self.db.begin().await?;
        let result = self.insert_event_with_conn(&txn, input, None).await;
        finalize_transaction(txn, result).await
    }

    /// Inserts an Event at version 1 together with the acting user as owner.
    pub(crate) async fn insert_event_with_conn<C: ConnectionTrait>(
        &self,
        db: &C,
        input: EventInput,
        challenge_id: Option<i64>,
    ) -> Result<event::Model, AppError> {
        ensure_non_empty("event title", &input.title)?;
        if input.end_at < input.start_at {
            return Err(AppError::InvalidInput(
                "event end_at must not be before start_at".to_string(),
            ));
        }

        let now = Utc::now();
        let active = event::ActiveModel {
            external_id: Set(Uuid::new_v4().to_string()),
            creator_id: Set(self.user_id.clone()),
            challenge_id: Set(challenge_id),
            title: Set(input.title),
            start_at: Set(input.start_at),
            end_at: Set(input.end_at),
            event_type: Set(input.event_type.as_str().to_string()),
            status: Set(EventStatus::Scheduled.as_str().to_string()),
            description: Set(input.description),
            color: Set(input
                .color
                .unwrap_or_else(|| self.settings.default_color.clone())),
            lock_version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };
        let insert = event::Entity::insert(active).exec(db).await?;
        let event = event::Entity::find_by_id(insert.last_insert_id)
            .one(db)
            .await?
            .ok_or_else(|| AppError::NotFound("event not found after insert".to_string()))?;

        let owner = event_user::ActiveModel {
            event_id: Set(event.id),
            user_id: Set(self.user_id.clone()),
            email: Set(self.email.clone()),
            role: Set(ParticipantRole::Owner.as_str().to_string()),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };
        event_user::Entity::insert(owner).exec(db).await?;

        tracing::info!(event_id = event.id, owner = %self.user_id, "event created");
        Ok(event)
    }

    pub async fn get_event(&self, id: i64) -> Result<event::Model, AppError> {
        let (event, _) = self.participant_with_conn(&self.db, id).await?;
        Ok(event)
    }

    /// Events the acting user participates in, earliest first.
    pub async fn list_events(&self) -> Result<Vec<event::Model>, AppError> {
        Ok(event::Entity::find()
            .inner_join(event_user::Entity)
            .filter(event_user::Column::UserId.eq(self.user_id.as_str()))
            .order_by_asc(event::Column::StartAt)
            .order_by_asc(event::Column::Id)
            .all(&self.db)
            .await?)
    }

    pub async fn update_event(
        &self,
        id: i64,
        expected_version: i32,
        patch: EventPatch,
    ) -> Result<event::Model, AppError> {
        if patch.is_empty() {
            return Err(AppError::InvalidInput("no event changes provided".to_string()));
        }
        let txn = self.db.begin().await?;
        let result: Result<event::Model, AppError> = async {
            // The write goes first so SQLite hands this transaction the write
            // lock; the role read after it cannot be raced by a role change.
            // Any write made without the right role is rolled back.
            let applied = self
                .apply_event_update_with_conn(&txn, id, expected_version, patch)
                .await;
            let (_, role) = self.participant_with_conn(&txn, id).await?;
            if !role.can_edit() {
                return Err(AppError::NotAuthorized(format!(
                    "{} is a {} on event id {id}",
                    self.user_id,
                    role.as_str()
                )));
            }
            applied
        }
        .await;
        let updated = finalize_transaction(txn, result).await;
        match &updated {
            Ok(event) => tracing::info!(
                event_id = id,
                version = event.lock_version,
                user = %self.user_id,
                "event updated"
            ),
            Err(AppError::VersionConflict { expected, current }) => tracing::warn!(
                event_id = id,
                expected,
                current = current.lock_version,
                "event update rejected"
            ),
            Err(_) => {}
        }
        updated
    }

    /// The single conditional write path for Event rows. The caller owns the
    /// transaction, so a patch that turns out invalid after the write rolls
    /// back together with the version bump.
    pub(crate) async fn apply_event_update_with_conn<C: ConnectionTrait>(
        &self,
        db: &C,
        id: i64,
        expected_version: i32,
        patch: EventPatch,
    ) -> Result<event::Model, AppError> {
        if let Some(title) = patch.title.as_deref() {
            ensure_non_empty("event title", title)?;
        }
        if let Some(color) = patch.color.as_deref() {
            ensure_non_empty("event color", color)?;
        }

        let mut update = event::Entity::update_many()
            .col_expr(
                event::Column::LockVersion,
                Expr::col(event::Column::LockVersion).add(1),
            )
            .col_expr(event::Column::UpdatedAt, Expr::value(Utc::now()));
        if let Some(title) = patch.title {
            update = update.col_expr(event::Column::Title, Expr::value(title));
        }
        if let Some(description) = patch.description {
            update = update.col_expr(event::Column::Description, Expr::value(description));
        }
        if let Some(start_at) = patch.start_at {
            update = update.col_expr(event::Column::StartAt, Expr::value(start_at));
        }
        if let Some(end_at) = patch.end_at {
            update = update.col_expr(event::Column::EndAt, Expr::value(end_at));
        }
        if let Some(color) = patch.color {
            update = update.col_expr(event::Column::Color, Expr::value(color));
        }
        if let Some(status) = patch.status {
            update = update.col_expr(event::Column::Status, Expr::value(status.as_str()));
        }

        let result = update
            .filter(event::Column::Id.eq(id))
            .filter(event::Column::LockVersion.eq(expected_version))
            .exec(db)
            .await?;

        if result.rows_affected == 0 {
            let current = event::Entity::find_by_id(id)
                .one(db)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("event id {id}")))?;
            return Err(AppError::VersionConflict {
                expected: expected_version,
                current: Box::new(current),
            });
        }

        let updated = event::Entity::find_by_id(id)
            .one(db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("event id {id}")))?;
        if updated.end_at < updated.start_at {
            return Err(AppError::InvalidInput(format!(
                "event id {id} would end before it starts"
            )));
        }
        Ok(updated)
    }

    /// Owner only. Participants and invitations go with the event.
    pub async fn delete_event(&self, id: i64) -> Result<(), AppError> {
        let txn = self.db.begin().await?;
        let result: Result<(), AppError> = async {
            let (_, role) = self.participant_with_conn(&txn, id).await?;
            if role != ParticipantRole::Owner {
                return Err(AppError::NotAuthorized(format!(
                    "only the owner can delete event id {id}"
                )));
            }
            invitation::Entity::delete_many()
                .filter(invitation::Column::EventId.eq(id))
                .exec(&txn)
                .await?;
            event_user::Entity::delete_many()
                .filter(event_user::Column::EventId.eq(id))
                .exec(&txn)
                .await?;
            event::Entity::delete_by_id(id).exec(&txn).await?;
            Ok(())
        }
        .await;

        finalize_transaction(txn, result).await?;
        tracing::info!(event_id = id, "event deleted");
        Ok(())
    }

    /// Loads the event and the acting user's role on it.
    pub(crate) async fn participant_with_conn<C: ConnectionTrait>(
        &self,
        db: &C,
        event_id: i64,
    ) -> Result<(event::Model, ParticipantRole), AppError> {
        let event = event::Entity::find_by_id(event_id)
            .one(db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("event id {event_id}")))?;
        let membership = event_user::Entity::find()
            .filter(event_user::Column::EventId.eq(event_id))
            .filter(event_user::Column::UserId.eq(self.user_id.as_str()))
            .one(db)
            .await?
            .ok_or_else(|| {
                AppError::NotAuthorized(format!(
                    "{} is not a participant of event id {event_id}",
                    self.user_id
                ))
            })?;
        let role = membership.role.parse()?;
        Ok((event, role))
    }
}
