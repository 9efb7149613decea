use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use backend_core::{EncryptionConfig, Membership};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, error, info};

use crate::{error::StoreError, schema};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const UPSERT_ROOM: &str = "INSERT INTO rooms (room_id, encryption_config) VALUES (?1, ?2)
     ON CONFLICT(room_id) DO UPDATE SET encryption_config = excluded.encryption_config";
const UPSERT_FILTER_ID: &str = "INSERT INTO account_filter_ids (user_id, filter_id) VALUES (?1, ?2)
     ON CONFLICT(user_id) DO UPDATE SET filter_id = excluded.filter_id";
const UPSERT_SYNC_CURSOR: &str = "INSERT INTO account_sync_cursors (user_id, next_batch_token)
     VALUES (?1, ?2)
     ON CONFLICT(user_id) DO UPDATE SET next_batch_token = excluded.next_batch_token";
const UPSERT_DEVICE_ID: &str = "INSERT INTO account_device_ids (user_id, device_id) VALUES (?1, ?2)
     ON CONFLICT(user_id) DO UPDATE SET device_id = excluded.device_id";

/// SQLite cache of room encryption state, room members and per-account sync
/// bookkeeping.
///
/// This is the only writer of those tables. Every mutation runs in its own
/// transaction, so concurrent readers never see half of a change. Cloning is
/// cheap and shares the connection.
#[derive(Clone)]
pub struct RoomStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for RoomStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomStateStore").finish_non_exhaustive()
    }
}

impl RoomStateStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self::with_connection(conn)?;

        info!(path = %path.display(), "room state store opened");
        Ok(store)
    }

    /// Volatile store, used by tests and dry runs.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Whether `room_id` has a non-null encryption configuration.
    ///
    /// Rooms the store has never seen are reported as unencrypted.
    pub fn is_encrypted(&self, room_id: &str) -> Result<bool, StoreError> {
        Ok(self.encryption_config(room_id)?.is_some())
    }

    /// Stored encryption configuration of `room_id`, if any.
    pub fn encryption_config(&self, room_id: &str) -> Result<Option<EncryptionConfig>, StoreError> {
        let conn = self.conn()?;
        let blob: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT encryption_config FROM rooms WHERE room_id = ?1",
                params![room_id],
                |row| row.get(0),
            )
            .optional()?;

        match blob.flatten() {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|err| {
                error!(room_id, error = %err, "stored encryption config is not valid JSON");
                StoreError::from(err)
            }),
            None => Ok(None),
        }
    }

    /// Record or clear the encryption configuration of `room_id`.
    pub fn set_encryption_config(
        &self,
        room_id: &str,
        config: Option<&EncryptionConfig>,
    ) -> Result<(), StoreError> {
        debug!(room_id, encrypted = config.is_some(), "updating encryption config");
        let blob = config.map(serde_json::to_vec).transpose()?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(UPSERT_ROOM, params![room_id, blob])?;
        tx.commit()?;
        Ok(())
    }

    /// Apply a membership change for `user_id` in `room_id`.
    ///
    /// Invite and join insert the pair (a repeat is a no-op); every other
    /// state removes it. Failures are logged and swallowed because the member
    /// list is a best-effort replica.
    pub fn set_membership(&self, room_id: &str, user_id: &str, membership: Membership) {
        debug!(room_id, user_id, ?membership, "updating room members");
        if let Err(err) = self.try_set_membership(room_id, user_id, membership) {
            error!(room_id, user_id, ?membership, error = %err, "failed to update room members");
        }
    }

    fn try_set_membership(
        &self,
        room_id: &str,
        user_id: &str,
        membership: Membership,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        if membership.is_invite_or_join() {
            tx.execute(
                "INSERT OR IGNORE INTO room_members (room_id, user_id) VALUES (?1, ?2)",
                params![room_id, user_id],
            )?;
        } else {
            tx.execute(
                "DELETE FROM room_members WHERE room_id = ?1 AND user_id = ?2",
                params![room_id, user_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Users currently invited to or joined in `room_id`, in no particular
    /// order. May lag the homeserver's view.
    pub fn get_room_members(&self, room_id: &str) -> Result<Vec<String>, StoreError> {
        self.query_column(
            "SELECT user_id FROM room_members WHERE room_id = ?1",
            room_id,
        )
    }

    /// Rooms in which `user_id` is invited or joined.
    pub fn find_rooms_containing(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        self.query_column(
            "SELECT room_id FROM room_members WHERE user_id = ?1",
            user_id,
        )
    }

    fn query_column(&self, sql: &str, key: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let values = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(values)
    }

    pub fn save_filter_id(&self, user_id: &str, filter_id: &str) -> Result<(), StoreError> {
        debug!(user_id, "saving filter id");
        self.upsert_account_value(UPSERT_FILTER_ID, user_id, filter_id)
    }

    /// Filter id last saved for `user_id`, or `NotFound`.
    pub fn load_filter_id(&self, user_id: &str) -> Result<String, StoreError> {
        self.load_account_value(
            "SELECT filter_id FROM account_filter_ids WHERE user_id = ?1",
            "filter id",
            user_id,
        )
    }

    pub fn save_sync_cursor(&self, user_id: &str, next_batch: &str) -> Result<(), StoreError> {
        debug!(user_id, "saving sync cursor");
        self.upsert_account_value(UPSERT_SYNC_CURSOR, user_id, next_batch)
    }

    /// Sync cursor last saved for `user_id`. `NotFound` means the account
    /// never completed a sync, which is different from an empty token.
    pub fn load_sync_cursor(&self, user_id: &str) -> Result<String, StoreError> {
        self.load_account_value(
            "SELECT next_batch_token FROM account_sync_cursors WHERE user_id = ?1",
            "sync cursor",
            user_id,
        )
    }

    /// Remember the device created for `user_id` so later logins reuse it.
    pub fn save_device_id(&self, user_id: &str, device_id: &str) -> Result<(), StoreError> {
        debug!(user_id, device_id, "saving device id");
        self.upsert_account_value(UPSERT_DEVICE_ID, user_id, device_id)
    }

    pub fn load_device_id(&self, user_id: &str) -> Result<String, StoreError> {
        self.load_account_value(
            "SELECT device_id FROM account_device_ids WHERE user_id = ?1",
            "device id",
            user_id,
        )
    }

    fn upsert_account_value(&self, sql: &str, user_id: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(sql, params![user_id, value])?;
        tx.commit()?;
        Ok(())
    }

    fn load_account_value(
        &self,
        sql: &str,
        what: &'static str,
        user_id: &str,
    ) -> Result<String, StoreError> {
        let conn = self.conn()?;
        conn.query_row(sql, params![user_id], |row| row.get::<_, String>(0))
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                what,
                key: user_id.to_owned(),
            })
    }
}
