use rusqlite::Connection;

/// Tables owned by the room state cache.
const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS rooms (
        room_id TEXT PRIMARY KEY,
        encryption_config BLOB
    );

    CREATE TABLE IF NOT EXISTS room_members (
        room_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        PRIMARY KEY (room_id, user_id)
    );

    CREATE TABLE IF NOT EXISTS account_filter_ids (
        user_id TEXT PRIMARY KEY,
        filter_id TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS account_sync_cursors (
        user_id TEXT PRIMARY KEY,
        next_batch_token TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS account_device_ids (
        user_id TEXT PRIMARY KEY,
        device_id TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_room_members_user
        ON room_members(user_id);
";

pub(crate) fn initialize(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}
