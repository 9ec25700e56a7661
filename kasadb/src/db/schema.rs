use rusqlite::Connection;

use crate::error::{Error, Result};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS encryption_keys (
        uuid            BLOB    NOT NULL PRIMARY KEY,
        encrypted_key   BLOB    NOT NULL,
        created_at      INTEGER NOT NULL,
        deleted_at      INTEGER
    );

    CREATE TABLE IF NOT EXISTS entities (
        uuid            BLOB    NOT NULL PRIMARY KEY,
        kind            TEXT    NOT NULL,
        parent          BLOB    NOT NULL,
        encryption_key  BLOB    NOT NULL REFERENCES encryption_keys (uuid),
        encrypted_data  BLOB    NOT NULL,
        created_at      INTEGER NOT NULL,
        updated_at      INTEGER NOT NULL,
        deleted_at      INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_entities_parent
    ON entities (parent, kind);

    CREATE TRIGGER IF NOT EXISTS entities_guard_immutable
    BEFORE UPDATE ON entities
    FOR EACH ROW
    WHEN NEW.uuid IS NOT OLD.uuid
      OR NEW.kind IS NOT OLD.kind
      OR NEW.parent IS NOT OLD.parent
      OR (NEW.encryption_key IS NOT OLD.encryption_key
          AND NEW.encrypted_data IS OLD.encrypted_data)
    BEGIN
        SELECT RAISE(ABORT, 'immutable entity column changed');
    END;

    CREATE TABLE IF NOT EXISTS blind_index (
        scope   BLOB,
        owner   BLOB NOT NULL,
        keyid   BLOB NOT NULL,
        value   BLOB NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_blind_index_value
    ON blind_index (value, scope);

    CREATE INDEX IF NOT EXISTS idx_blind_index_owner
    ON blind_index (owner, scope);
";

pub(super) fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA).map_err(|err| Error::backing_store(SCHEMA, 0, err))
}
