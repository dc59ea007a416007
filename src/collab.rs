use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};

use crate::app::{finalize_transaction, App};
use crate::entities::{challenge, event_user, invitation};
use crate::error::AppError;
use crate::model::{InvitationStatus, ParticipantRole};

/// Outcome of looking up an invitation by token. A lapsed invitation has
/// already had its status corrected on the open transaction.
enum Lookup {
    Pending(invitation::Model),
    Lapsed(AppError),
}

fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    hex::encode(bytes)
}

fn normalize_email(email: &str) -> Result<String, AppError> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(AppError::InvalidInput(format!("invalid email '{email}'"))),
    }
}

impl App {
    pub async fn invite(
        &self,
        event_id: i64,
        email: &str,
        role: ParticipantRole,
        now: DateTime<Utc>,
    ) -> Result<invitation::Model, AppError> {
        let email = normalize_email(email)?;
        if role == ParticipantRole::Owner {
            return Err(AppError::InvalidInput(
                "invitations can grant editor or viewer only".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let result: Result<invitation::Model, AppError> = async {
            let (_, inviter_role) = self.participant_with_conn(&txn, event_id).await?;
            if !inviter_role.can_edit() {
                return Err(AppError::NotAuthorized(format!(
                    "{} is a {} on event id {event_id} and cannot invite",
                    self.user_id,
                    inviter_role.as_str()
                )));
            }

            let existing = event_user::Entity::find()
                .filter(event_user::Column::EventId.eq(event_id))
                .filter(event_user::Column::Email.eq(email.as_str()))
                .one(&txn)
                .await?;
            if let Some(participant) = existing {
                return Err(AppError::AlreadyParticipant(format!(
                    "{email} is already on event id {event_id} as {}",
                    participant.role
                )));
            }

            // One live invitation per address; the newest one wins.
            invitation::Entity::update_many()
                .col_expr(
                    invitation::Column::Status,
                    Expr::value(InvitationStatus::Expired.as_str()),
                )
                .filter(invitation::Column::EventId.eq(event_id))
                .filter(invitation::Column::Email.eq(email.as_str()))
                .filter(invitation::Column::Status.eq(InvitationStatus::Pending.as_str()))
                .exec(&txn)
                .await?;

            let active = invitation::ActiveModel {
                event_id: Set(event_id),
                inviter_id: Set(self.user_id.clone()),
                email: Set(email.clone()),
                role: Set(role.as_str().to_string()),
                token: Set(generate_token()),
                status: Set(InvitationStatus::Pending.as_str().to_string()),
                expires_at: Set(now + Duration::days(self.settings.invitation_ttl_days)),
                responded_by: Set(None),
                responded_at: Set(None),
                created_at: Set(now),
                ..Default::default()
            };
            Ok(active.insert(&txn).await?)
        }
        .await;

        let invitation = finalize_transaction(txn, result).await?;
        tracing::info!(
            event_id,
            invitation_id = invitation.id,
            role = %invitation.role,
            "invitation created"
        );
        Ok(invitation)
    }

    pub async fn accept_invitation(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<(invitation::Model, event_user::Model), AppError> {
        let txn = self.db.begin().await?;
        let invitation = match self.lookup_invitation_with_conn(&txn, token, now).await {
            Ok(Lookup::Pending(invitation)) => invitation,
            Ok(Lookup::Lapsed(err)) => {
                txn.commit().await?;
                return Err(err);
            }
            Err(err) => return finalize_transaction(txn, Err(err)).await,
        };

        let result: Result<(invitation::Model, event_user::Model), AppError> = async {
            let event_id = invitation.event_id;
            let already = event_user::Entity::find()
                .filter(event_user::Column::EventId.eq(event_id))
                .filter(event_user::Column::UserId.eq(self.user_id.as_str()))
                .one(&txn)
                .await?;
            if already.is_some() {
                return Err(AppError::AlreadyParticipant(format!(
                    "{} is already on event id {event_id}",
                    self.user_id
                )));
            }

            let participant = event_user::ActiveModel {
                event_id: Set(event_id),
                user_id: Set(self.user_id.clone()),
                email: Set(Some(invitation.email.clone())),
                role: Set(invitation.role.clone()),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            }
            .insert(&txn)
            .await?;

            let invitation = self
                .resolve_invitation_with_conn(&txn, invitation, InvitationStatus::Accepted, now)
                .await?;
            Ok((invitation, participant))
        }
        .await;

        let accepted = finalize_transaction(txn, result).await?;
        tracing::info!(
            event_id = accepted.0.event_id,
            user = %self.user_id,
            role = %accepted.1.role,
            "invitation accepted"
        );
        Ok(accepted)
    }

    pub async fn decline_invitation(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<invitation::Model, AppError> {
        let txn = self.db.begin().await?;
        let invitation = match self.lookup_invitation_with_conn(&txn, token, now).await {
            Ok(Lookup::Pending(invitation)) => invitation,
            Ok(Lookup::Lapsed(err)) => {
                txn.commit().await?;
                return Err(err);
            }
            Err(err) => return finalize_transaction(txn, Err(err)).await,
        };
        let result = self
            .resolve_invitation_with_conn(&txn, invitation, InvitationStatus::Declined, now)
            .await;
        finalize_transaction(txn, result).await
    }

    /// Owner/editor view of an event's invitations. Pending rows past their
    /// expiry are corrected before they are returned.
    pub async fn list_invitations(
        &self,
        event_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<invitation::Model>, AppError> {
        let txn = self.db.begin().await?;
        let result: Result<Vec<invitation::Model>, AppError> = async {
            let (_, role) = self.participant_with_conn(&txn, event_id).await?;
            if !role.can_edit() {
                return Err(AppError::NotAuthorized(format!(
                    "{} cannot view invitations of event id {event_id}",
                    self.user_id
                )));
            }
            invitation::Entity::update_many()
                .col_expr(
                    invitation::Column::Status,
                    Expr::value(InvitationStatus::Expired.as_str()),
                )
                .filter(invitation::Column::EventId.eq(event_id))
                .filter(invitation::Column::Status.eq(InvitationStatus::Pending.as_str()))
                .filter(invitation::Column::ExpiresAt.lt(now))
                .exec(&txn)
                .await?;
            Ok(invitation::Entity::find()
                .filter(invitation::Column::EventId.eq(event_id))
                .order_by_asc(invitation::Column::CreatedAt)
                .order_by_asc(invitation::Column::Id)
                .all(&txn)
                .await?)
        }
        .await;

        finalize_transaction(txn, result).await
    }

    pub async fn list_participants(
        &self,
        event_id: i64,
    ) -> Result<Vec<event_user::Model>, AppError> {
        self.participant_with_conn(&self.db, event_id).await?;
        Ok(event_user::Entity::find()
            .filter(event_user::Column::EventId.eq(event_id))
            .order_by_asc(event_user::Column::Id)
            .all(&self.db)
            .await?)
    }

    /// Owner only. Ownership is neither granted nor revoked here.
    pub async fn change_role(
        &self,
        event_id: i64,
        target_user: &str,
        new_role: ParticipantRole,
    ) -> Result<event_user::Model, AppError> {
        if new_role == ParticipantRole::Owner {
            return Err(AppError::InvalidInput(
                "the owner role cannot be granted through a role change".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let result: Result<event_user::Model, AppError> = async {
            let (_, role) = self.participant_with_conn(&txn, event_id).await?;
            if role != ParticipantRole::Owner {
                return Err(AppError::NotAuthorized(format!(
                    "only the owner can change roles on event id {event_id}"
                )));
            }
            let target = membership_with_conn(&txn, event_id, target_user).await?;
            if target.role == ParticipantRole::Owner.as_str() {
                return Err(AppError::InvalidState(format!(
                    "the owner of event id {event_id} keeps the owner role"
                )));
            }
            let mut active: event_user::ActiveModel = target.into();
            active.role = Set(new_role.as_str().to_string());
            active.updated_at = Set(Utc::now());
            Ok(active.update(&txn).await?)
        }
        .await;

        let updated = finalize_transaction(txn, result).await?;
        tracing::info!(event_id, target = target_user, role = %updated.role, "role changed");
        Ok(updated)
    }

    /// The owner removes anyone else; everyone else may only leave.
    pub async fn remove_participant(
        &self,
        event_id: i64,
        target_user: &str,
    ) -> Result<event_user::Model, AppError> {
        let txn = self.db.begin().await?;
        let result: Result<event_user::Model, AppError> = async {
            let (event, role) = self.participant_with_conn(&txn, event_id).await?;
            let target = membership_with_conn(&txn, event_id, target_user).await?;
            if target.role == ParticipantRole::Owner.as_str() {
                return Err(AppError::InvalidState(format!(
                    "the owner cannot be removed from event id {event_id}"
                )));
            }
            if role != ParticipantRole::Owner && target.user_id != self.user_id {
                return Err(AppError::NotAuthorized(format!(
                    "{} can only remove themself from event id {event_id}",
                    self.user_id
                )));
            }
            if let Some(challenge_id) = event.challenge_id {
                let bound = challenge::Entity::find_by_id(challenge_id).one(&txn).await?;
                if bound.is_some_and(|challenge| challenge.user_id == target.user_id) {
                    return Err(AppError::InvalidState(format!(
                        "{} owns challenge id {challenge_id} bound to event id {event_id}",
                        target.user_id
                    )));
                }
            }
            event_user::Entity::delete_by_id(target.id).exec(&txn).await?;
            Ok(target)
        }
        .await;

        let removed = finalize_transaction(txn, result).await?;
        tracing::info!(event_id, target = %removed.user_id, "participant removed");
        Ok(removed)
    }

    async fn lookup_invitation_with_conn(
        &self,
        txn: &DatabaseTransaction,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Lookup, AppError> {
        let invitation = invitation::Entity::find()
            .filter(invitation::Column::Token.eq(token.trim()))
            .one(txn)
            .await?
            .ok_or_else(|| AppError::NotFound("invitation token".to_string()))?;

        if invitation.status == InvitationStatus::Pending.as_str() && now > invitation.expires_at
        {
            let expires_at = invitation.expires_at;
            let event_id = invitation.event_id;
            let mut active: invitation::ActiveModel = invitation.into();
            active.status = Set(InvitationStatus::Expired.as_str().to_string());
            active.update(txn).await?;
            tracing::debug!(event_id, "invitation expired on read");
            return Ok(Lookup::Lapsed(AppError::Expired(format!(
                "invitation to event id {event_id} expired at {}",
                expires_at.to_rfc3339()
            ))));
        }
        if invitation.status == InvitationStatus::Expired.as_str() {
            return Ok(Lookup::Lapsed(AppError::Expired(format!(
                "invitation to event id {} has expired",
                invitation.event_id
            ))));
        }
        if invitation.status != InvitationStatus::Pending.as_str() {
            return Err(AppError::AlreadyResolved(invitation.status));
        }
        Ok(Lookup::Pending(invitation))
    }

    async fn resolve_invitation_with_conn<C: ConnectionTrait>(
        &self,
        db: &C,
        invitation: invitation::Model,
        status: InvitationStatus,
        now: DateTime<Utc>,
    ) -> Result<invitation::Model, AppError> {
        let mut active: invitation::ActiveModel = invitation.into();
        active.status = Set(status.as_str().to_string());
        active.responded_by = Set(Some(self.user_id.clone()));
        active.responded_at = Set(Some(now));
        Ok(active.update(db).await?)
    }
}

async fn membership_with_conn<C: ConnectionTrait>(
    db: &C,
    event_id: i64,
    user_id: &str,
) -> Result<event_user::Model, AppError> {
    event_user::Entity::find()
        .filter(event_user::Column::EventId.eq(event_id))
        .filter(event_user::Column::UserId.eq(user_id))
        .one(db)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("participant {user_id} on event id {event_id}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::db;
    use crate::entities::event;
    use crate::model::{EventInput, EventPatch, EventType};
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn app_as(dir: &TempDir, user: &str) -> App {
        let db_path = db::resolve_db_path(dir.path());
        db::ensure_parent_dir(&db_path).expect("ensure parent");
        let db = db::connect(&db_path).await.expect("connect db");
        db::ensure_schema(&db).await.expect("ensure schema");
        App::new(
            db,
            user.to_string(),
            Some(format!("{user}@example.com")),
            Settings::default(),
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    async fn shared_event(owner: &App) -> event::Model {
        owner
            .create_event(EventInput {
                title: "Trip".to_string(),
                start_at: now(),
                end_at: now() + Duration::days(2),
                event_type: EventType::Normal,
                description: None,
                color: None,
            })
            .await
            .expect("create event")
    }

    async fn join(owner: &App, guest: &App, event_id: i64, role: ParticipantRole) {
        let email = guest.email.clone().expect("guest email");
        let invitation = owner
            .invite(event_id, &email, role, now())
            .await
            .expect("invite");
        guest
            .accept_invitation(&invitation.token, now())
            .await
            .expect("accept");
    }

    #[tokio::test]
    async fn accepted_invitation_adds_participant_with_role() {
        let dir = TempDir::new().expect("temp dir");
        let alice = app_as(&dir, "alice").await;
        let bob = app_as(&dir, "bob").await;
        let event = shared_event(&alice).await;

        let invitation = alice
            .invite(event.id, "Bob@Example.com", ParticipantRole::Editor, now())
            .await
            .expect("invite");
        assert_eq!(invitation.token.len(), 64);
        assert_eq!(invitation.email, "bob@example.com");
        assert_eq!(invitation.expires_at, now() + Duration::days(7));

        let (accepted, participant) = bob
            .accept_invitation(&invitation.token, now() + Duration::days(1))
            .await
            .expect("accept");
        assert_eq!(accepted.status, "accepted");
        assert_eq!(accepted.responded_by.as_deref(), Some("bob"));
        assert_eq!(participant.role, "editor");

        let updated = bob
            .update_event(
                event.id,
                1,
                EventPatch {
                    title: Some("Road trip".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("editor update");
        assert_eq!(updated.lock_version, 2);
        assert_eq!(alice.list_participants(event.id).await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn late_accept_marks_invitation_expired() {
        let dir = TempDir::new().expect("temp dir");
        let alice = app_as(&dir, "alice").await;
        let bob = app_as(&dir, "bob").await;
        let event = shared_event(&alice).await;
        let invitation = alice
            .invite(event.id, "bob@example.com", ParticipantRole::Viewer, now())
            .await
            .expect("invite");

        let err = bob
            .accept_invitation(&invitation.token, now() + Duration::days(8))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Expired(_)));

        let stored = invitation::Entity::find_by_id(invitation.id)
            .one(&alice.db)
            .await
            .expect("query")
            .expect("invitation");
        assert_eq!(stored.status, "expired");
        assert_eq!(alice.list_participants(event.id).await.expect("list").len(), 1);

        let err = bob
            .accept_invitation(&invitation.token, now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Expired(_)));
    }

    #[tokio::test]
    async fn resolved_invitation_cannot_be_reused() {
        let dir = TempDir::new().expect("temp dir");
        let alice = app_as(&dir, "alice").await;
        let bob = app_as(&dir, "bob").await;
        let carol = app_as(&dir, "carol").await;
        let event = shared_event(&alice).await;
        let invitation = alice
            .invite(event.id, "bob@example.com", ParticipantRole::Viewer, now())
            .await
            .expect("invite");
        bob.decline_invitation(&invitation.token, now())
            .await
            .expect("decline");

        let err = carol
            .accept_invitation(&invitation.token, now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyResolved(status) if status == "declined"));
    }

    #[tokio::test]
    async fn existing_participants_cannot_be_invited() {
        let dir = TempDir::new().expect("temp dir");
        let alice = app_as(&dir, "alice").await;
        let bob = app_as(&dir, "bob").await;
        let event = shared_event(&alice).await;
        join(&alice, &bob, event.id, ParticipantRole::Viewer).await;

        let err = alice
            .invite(event.id, "bob@example.com", ParticipantRole::Editor, now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyParticipant(_)));

        let err = bob
            .invite(event.id, "carol@example.com", ParticipantRole::Viewer, now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn reinvite_supersedes_pending_invitation() {
        let dir = TempDir::new().expect("temp dir");
        let alice = app_as(&dir, "alice").await;
        let bob = app_as(&dir, "bob").await;
        let event = shared_event(&alice).await;
        let first = alice
            .invite(event.id, "bob@example.com", ParticipantRole::Viewer, now())
            .await
            .expect("first invite");
        let second = alice
            .invite(event.id, "bob@example.com", ParticipantRole::Editor, now())
            .await
            .expect("second invite");
        assert_ne!(first.token, second.token);

        let err = bob.accept_invitation(&first.token, now()).await.unwrap_err();
        assert!(matches!(err, AppError::Expired(_)));
        let (_, participant) = bob
            .accept_invitation(&second.token, now())
            .await
            .expect("accept second");
        assert_eq!(participant.role, "editor");
    }

    #[tokio::test]
    async fn listing_invitations_expires_stale_rows() {
        let dir = TempDir::new().expect("temp dir");
        let alice = app_as(&dir, "alice").await;
        let event = shared_event(&alice).await;
        alice
            .invite(event.id, "bob@example.com", ParticipantRole::Viewer, now())
            .await
            .expect("invite");

        let listed = alice
            .list_invitations(event.id, now() + Duration::days(1))
            .await
            .expect("list");
        assert_eq!(listed[0].status, "pending");
        let listed = alice
            .list_invitations(event.id, now() + Duration::days(30))
            .await
            .expect("list");
        assert_eq!(listed[0].status, "expired");
    }

    #[tokio::test]
    async fn only_owner_changes_roles() {
        let dir = TempDir::new().expect("temp dir");
        let alice = app_as(&dir, "alice").await;
        let bob = app_as(&dir, "bob").await;
        let carol = app_as(&dir, "carol").await;
        let event = shared_event(&alice).await;
        join(&alice, &bob, event.id, ParticipantRole::Editor).await;
        join(&alice, &carol, event.id, ParticipantRole::Viewer).await;

        let err = bob
            .change_role(event.id, "carol", ParticipantRole::Editor)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotAuthorized(_)));

        let promoted = alice
            .change_role(event.id, "carol", ParticipantRole::Editor)
            .await
            .expect("promote");
        assert_eq!(promoted.role, "editor");

        let err = alice
            .change_role(event.id, "bob", ParticipantRole::Owner)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        let err = alice
            .change_role(event.id, "alice", ParticipantRole::Viewer)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));

        let current = alice.get_event(event.id).await.expect("event");
        assert_eq!(current.lock_version, 1);
    }

    #[tokio::test]
    async fn participants_leave_but_owner_stays() {
        let dir = TempDir::new().expect("temp dir");
        let alice = app_as(&dir, "alice").await;
        let bob = app_as(&dir, "bob").await;
        let carol = app_as(&dir, "carol").await;
        let event = shared_event(&alice).await;
        join(&alice, &bob, event.id, ParticipantRole::Editor).await;
        join(&alice, &carol, event.id, ParticipantRole::Viewer).await;

        let err = bob.remove_participant(event.id, "carol").await.unwrap_err();
        assert!(matches!(err, AppError::NotAuthorized(_)));
        let err = bob.remove_participant(event.id, "alice").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));

        carol
            .remove_participant(event.id, "carol")
            .await
            .expect("leave");
        alice
            .remove_participant(event.id, "bob")
            .await
            .expect("remove");

        let remaining = alice.list_participants(event.id).await.expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].user_id, "alice");
        assert_eq!(remaining[0].role, "owner");
    }
}
