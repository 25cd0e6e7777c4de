//! # User Federation Sync
//!
//! Keeps user identities and role assignments consistent across gardens.
//!
//! ## Flows
//! ```text
//!   PUSH   initiate_user_sync
//!          for each remote garden:
//!              users ─► filter_role_assignments(garden) ─► USER_SYNC ─► route
//!
//!   IMPORT user_sync(serialized_users)
//!          for each record:
//!              exists?            ─► update (pre-hashed credential kept as is)
//!              new + assignments  ─► create, then update
//!              new + none         ─► skip
//!          then PUSH again, so the sync floods the connected graph
//!
//!   ABSORB handle_event(USER_UPDATED from another garden)
//!              ─► upsert RemoteUser shadow {garden, username, assignments, timestamp}
//! ```
//!
//! Re-importing the same payload converges to the same stored state.

use std::sync::Arc;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use garden_core::validation::validate_username;
use garden_core::{
    filter_role_assignments, EventPayload, Garden, GardenEvent, Operation, OperationKind,
    RemoteUser, Response, RoleAssignment, SyncedUser, User, ValidationError,
};
use garden_db::Database;

use crate::error::{SyncError, SyncResult};
use crate::events::EventBus;
use crate::listener::EventHandler;
use crate::router::{HandlerTableBuilder, OperationHandler, Router};

/// Kwarg carrying the serialized user list of a USER_SYNC operation.
pub const SERIALIZED_USERS_KWARG: &str = "serialized_users";

/// Fields of a user that an update may change. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserPatch {
    /// Plain password, hashed before it is stored.
    pub password: Option<String>,
    pub role_assignments: Option<Vec<RoleAssignment>>,
}

// =============================================================================
// User Sync
// =============================================================================

pub struct UserSync {
    db: Database,
    garden_name: String,
    bus: EventBus,
}

impl UserSync {
    pub fn new(db: Database, garden_name: impl Into<String>, bus: EventBus) -> Self {
        UserSync {
            db,
            garden_name: garden_name.into(),
            bus,
        }
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Creates and stores a local user. A password is stored as an Argon2
    /// PHC string.
    pub async fn create_user(
        &self,
        username: &str,
        password: Option<&str>,
        role_assignments: Vec<RoleAssignment>,
    ) -> SyncResult<User> {
        validate_username(username)?;

        let user = User {
            username: username.to_string(),
            password: password.map(hash_password).transpose()?,
            role_assignments,
        };

        self.db.users().upsert(&user).await?;
        info!(username = %user.username, "User created");
        Ok(user)
    }

    /// Applies `patch` to `user`, saves it and publishes USER_UPDATED.
    ///
    /// A `hashed_password` is stored as is and wins over `patch.password`.
    pub async fn update_user(
        &self,
        mut user: User,
        patch: UserPatch,
        hashed_password: Option<String>,
    ) -> SyncResult<User> {
        if let Some(role_assignments) = patch.role_assignments {
            user.role_assignments = role_assignments;
        }

        match (hashed_password, patch.password) {
            (Some(hashed), _) => user.password = Some(hashed),
            (None, Some(plain)) => user.password = Some(hash_password(&plain)?),
            (None, None) => {}
        }

        self.db.users().upsert(&user).await?;
        debug!(username = %user.username, "User saved");

        self.bus
            .publish(GardenEvent::user_updated(&self.garden_name, user.to_synced()));
        Ok(user)
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Sends every local user, filtered per garden, to each remote garden.
    ///
    /// Fire-and-forget: a garden that cannot be reached is logged and
    /// skipped.
    pub async fn initiate_user_sync(&self, router: &Router) -> SyncResult<()> {
        let users = self.db.users().list().await?;
        let gardens = self.db.gardens().list_remote().await?;

        for garden in gardens {
            let serialized: Vec<SyncedUser> = users
                .iter()
                .map(|user| filter_role_assignments(user, &garden).to_synced_with_credential())
                .collect();

            let operation = Operation::new(OperationKind::UserSync)
                .with_target(&garden.name)
                .with_kwarg(SERIALIZED_USERS_KWARG, serde_json::to_value(&serialized)?);

            match router.route(operation).await {
                Ok(_) => info!(garden = %garden.name, users = serialized.len(), "User sync sent"),
                Err(e) => warn!(garden = %garden.name, error = %e, "User sync not sent"),
            }
        }

        Ok(())
    }

    // =========================================================================
    // Import
    // =========================================================================

    /// Imports `serialized_users`, then pushes the result onward.
    pub async fn user_sync(&self, router: &Router, serialized_users: &[Value]) -> SyncResult<()> {
        for record in serialized_users {
            if let Err(e) = self.import_user(record).await {
                let username = record
                    .get("username")
                    .and_then(Value::as_str)
                    .unwrap_or("<unknown>");
                info!("Failed to import user {} due to error: {}", username, e);
            }
        }

        self.initiate_user_sync(router).await
    }

    async fn import_user(&self, record: &Value) -> SyncResult<()> {
        let synced = SyncedUser::from_value(record)?;
        validate_username(&synced.username)?;

        // TODO: decide whether an existing user left with no assignments after
        // filtering should be deleted; for now the empty set is stored.
        let user = match self.db.users().get(&synced.username).await? {
            Some(user) => user,
            None if synced.role_assignments.is_empty() => {
                debug!(username = %synced.username, "Skipping import of user with no assignments");
                return Ok(());
            }
            None => {
                let user = User::new(&synced.username);
                self.db.users().upsert(&user).await?;
                user
            }
        };

        let patch = UserPatch {
            password: None,
            role_assignments: Some(synced.role_assignments),
        };
        self.update_user(user, patch, synced.hashed_password).await?;
        Ok(())
    }

    // =========================================================================
    // Drift Check
    // =========================================================================

    /// True when `garden`'s cached shadow of `user` holds exactly the
    /// assignments `user` has for that garden.
    pub async fn user_synced_with_garden(&self, user: &User, garden: &Garden) -> SyncResult<bool> {
        let Some(remote) = self.db.remote_users().get(&garden.name, &user.username).await? else {
            return Ok(false);
        };

        let filtered = filter_role_assignments(user, garden);
        Ok(filtered.role_assignments == remote.role_assignments)
    }

    async fn absorb(&self, event: &GardenEvent) -> SyncResult<()> {
        match &event.payload {
            EventPayload::UserUpdated(updated) => {
                let remote = RemoteUser {
                    garden: updated.garden.clone(),
                    username: updated.user.username.clone(),
                    role_assignments: updated.user.role_assignments.clone(),
                    updated_at: updated.timestamp,
                };
                self.db.remote_users().upsert(&remote).await?;
                debug!(
                    garden = %remote.garden,
                    username = %remote.username,
                    "Remote user shadow updated"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for UserSync {
    async fn handle_event(&self, event: &GardenEvent) {
        if event.garden == self.garden_name {
            return;
        }

        if let Err(e) = self.absorb(event).await {
            error!("Error handling {} event from garden {}: {}", event.name(), event.garden, e);
        }
    }
}

fn hash_password(plain: &str) -> SyncResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| SyncError::Internal(format!("Failed to hash password: {}", e)))
}

// =============================================================================
// Operation Handler
// =============================================================================

/// Registers the USER_SYNC handler.
pub fn register(
    builder: HandlerTableBuilder,
    users: Arc<UserSync>,
) -> SyncResult<HandlerTableBuilder> {
    builder.register(OperationKind::UserSync, Arc::new(UserSyncOperation { users }))
}

struct UserSyncOperation {
    users: Arc<UserSync>,
}

#[async_trait]
impl OperationHandler for UserSyncOperation {
    async fn handle(&self, router: &Router, operation: Operation) -> SyncResult<Response> {
        let serialized_users = operation
            .kwarg(SERIALIZED_USERS_KWARG)
            .or_else(|| operation.args().first())
            .and_then(Value::as_array)
            .ok_or_else(|| ValidationError::Required {
                field: SERIALIZED_USERS_KWARG.into(),
            })?;

        self.users.user_sync(router, serialized_users).await?;
        Ok(Response::ack())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{GardenRegistry, GardenTransport};
    use crate::router::HandlerTable;
    use crate::testing::StubTransport;
    use garden_core::{ConnectionType, RoleDomain};
    use garden_db::DbConfig;
    use serde_json::json;

    async fn setup() -> (Database, Arc<UserSync>, EventBus) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let bus = EventBus::default();
        let users = Arc::new(UserSync::new(db.clone(), "parent", bus.clone()));
        (db, users, bus)
    }

    fn child() -> Garden {
        Garden::new("child", Some(ConnectionType::Stomp)).with_namespaces(["ns1"])
    }

    fn assignments() -> Vec<RoleAssignment> {
        vec![
            RoleAssignment::new("admin", RoleDomain::Global),
            RoleAssignment::new("operator", RoleDomain::Garden { name: "b".into() }),
            RoleAssignment::new(
                "read_only",
                RoleDomain::System {
                    namespace: "ns1".into(),
                },
            ),
        ]
    }

    /// Router whose only remote garden is `child`, reached through `remote`.
    async fn router_to_child(db: &Database, users: Arc<UserSync>, remote: Arc<StubTransport>) -> Router {
        db.gardens().upsert(&child()).await.unwrap();
        let registry = GardenRegistry::new();
        let transport: Arc<dyn GardenTransport> = remote;
        registry.register(child(), Some(transport));

        let table = register(HandlerTable::builder(), users).unwrap().build();
        Router::new("parent", table, registry)
    }

    #[tokio::test]
    async fn test_create_user_hashes_password() {
        let (db, users, _bus) = setup().await;

        let user = users.create_user("ada", Some("s3cret"), assignments()).await.unwrap();
        let stored = db.users().get("ada").await.unwrap().unwrap();

        let hash = stored.password.unwrap();
        assert!(hash.starts_with("$argon2"));
        assert_ne!(hash, "s3cret");
        assert_eq!(stored.role_assignments, user.role_assignments);

        assert!(users.create_user("a b", None, Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_update_user_publishes_event() {
        let (_db, users, bus) = setup().await;
        let mut rx = bus.subscribe();
        let user = users.create_user("ada", None, Vec::new()).await.unwrap();

        let patch = UserPatch {
            password: Some("plain".into()),
            role_assignments: Some(assignments()),
        };
        let updated = users
            .update_user(user, patch, Some("$argon2id$prehashed".into()))
            .await
            .unwrap();
        assert_eq!(updated.password.as_deref(), Some("$argon2id$prehashed"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.garden, "parent");
        let EventPayload::UserUpdated(payload) = event.payload;
        assert_eq!(payload.user.username, "ada");
        assert_eq!(payload.user.role_assignments.len(), 3);
    }

    #[tokio::test]
    async fn test_push_filters_assignments_per_garden() {
        let (db, users, _bus) = setup().await;
        let ada = users
            .create_user("ada", Some("s3cret"), assignments())
            .await
            .unwrap();
        let hash = ada.password.clone().unwrap();

        let remote = StubTransport::replying(Ok(Response::ack()));
        let router = router_to_child(&db, users.clone(), remote.clone()).await;

        users.initiate_user_sync(&router).await.unwrap();

        let published = remote.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].operation_type(), "USER_SYNC");

        let sent = &published[0].kwarg(SERIALIZED_USERS_KWARG).unwrap()[0];
        let synced = SyncedUser::from_value(sent).unwrap();
        assert_eq!(
            synced.role_assignments,
            vec![assignments()[0].clone(), assignments()[2].clone()]
        );
        assert_eq!(synced.hashed_password.as_deref(), Some(hash.as_str()));

        // the receiving garden stores the credential unchanged
        let (child_db, child_users, _child_bus) = setup().await;
        let child_router = router_to_child(
            &child_db,
            child_users.clone(),
            StubTransport::replying(Ok(Response::ack())),
        )
        .await;
        child_users
            .user_sync(&child_router, std::slice::from_ref(sent))
            .await
            .unwrap();

        let imported = child_db.users().get("ada").await.unwrap().unwrap();
        assert_eq!(imported.password.as_deref(), Some(hash.as_str()));
        assert_eq!(imported.role_assignments, synced.role_assignments);
    }

    #[tokio::test]
    async fn test_push_skips_unreachable_gardens() {
        let (db, users, _bus) = setup().await;
        users.create_user("ada", None, assignments()).await.unwrap();

        let router = router_to_child(&db, users.clone(), StubTransport::disconnected()).await;
        users.initiate_user_sync(&router).await.unwrap();
    }

    #[tokio::test]
    async fn test_import_rules_and_repush() {
        let (db, users, _bus) = setup().await;
        users.create_user("existing", None, assignments()).await.unwrap();

        let remote = StubTransport::replying(Ok(Response::ack()));
        let router = router_to_child(&db, users.clone(), remote.clone()).await;

        let payload = vec![
            json!({"username": "existing", "role_assignments": [], "hashed_password": "$argon2id$x"}),
            json!({"username": "newbie", "role_assignments": [
                {"role": {"name": "admin"}, "domain": {"scope": "Global"}}
            ]}),
            json!({"username": "ghost", "role_assignments": []}),
            json!({"username": "broken", "role_assignments": [
                {"role": {"name": "admin"}, "domain": {"scope": "Planet"}}
            ]}),
        ];

        let response = router
            .route(Operation::new(OperationKind::UserSync).with_kwarg(SERIALIZED_USERS_KWARG, json!(payload)))
            .await
            .unwrap();
        assert!(response.is_empty());

        let existing = db.users().get("existing").await.unwrap().unwrap();
        assert!(existing.role_assignments.is_empty());
        assert_eq!(existing.password.as_deref(), Some("$argon2id$x"));

        let newbie = db.users().get("newbie").await.unwrap().unwrap();
        assert_eq!(newbie.role_assignments.len(), 1);

        assert!(db.users().get("ghost").await.unwrap().is_none());
        assert!(db.users().get("broken").await.unwrap().is_none());

        // imported state was pushed onward
        assert_eq!(remote.published().len(), 1);
    }

    #[tokio::test]
    async fn test_import_is_idempotent() {
        let (db, users, _bus) = setup().await;
        let remote = StubTransport::replying(Ok(Response::ack()));
        let router = router_to_child(&db, users.clone(), remote).await;

        let payload = vec![json!({
            "username": "ada",
            "role_assignments": [{"role": {"name": "admin"}, "domain": {"scope": "Global"}}]
        })];

        users.user_sync(&router, &payload).await.unwrap();
        let once = db.users().list().await.unwrap();
        users.user_sync(&router, &payload).await.unwrap();
        let twice = db.users().list().await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
    }

    #[tokio::test]
    async fn test_user_sync_requires_payload() {
        let (db, users, _bus) = setup().await;
        let router = router_to_child(&db, users, StubTransport::disconnected()).await;

        let err = router
            .route(Operation::new(OperationKind::UserSync))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn test_event_absorption_and_drift_check() {
        let (db, users, _bus) = setup().await;
        let user = users.create_user("ada", None, assignments()).await.unwrap();
        let garden = child();

        assert!(!users.user_synced_with_garden(&user, &garden).await.unwrap());

        // own events are never imported
        users
            .handle_event(&GardenEvent::user_updated("parent", user.to_synced()))
            .await;
        assert!(db.remote_users().get("parent", "ada").await.unwrap().is_none());

        let filtered = filter_role_assignments(&user, &garden);
        users
            .handle_event(&GardenEvent::user_updated("child", filtered.to_synced()))
            .await;
        assert!(users.user_synced_with_garden(&user, &garden).await.unwrap());

        // the shadow reports the full set, which differs from the filtered view
        users
            .handle_event(&GardenEvent::user_updated("child", user.to_synced()))
            .await;
        assert!(!users.user_synced_with_garden(&user, &garden).await.unwrap());
    }
}
