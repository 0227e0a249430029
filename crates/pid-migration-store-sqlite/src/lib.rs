use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};

use pid_migration_core::RawField;

/// Read-only view over a legacy Handle server's SQL storage.
///
/// The server keeps one row per field in a `handles` table keyed by the
/// handle string and the field index. Timestamps are stored as Unix epoch
/// seconds. The migration never writes back; mutation travels through the
/// batch artifact instead.
#[derive(Debug)]
pub struct HandleStore {
    conn: Connection,
}

impl HandleStore {
    /// Open the server database read-only.
    ///
    /// # Errors
    /// Fails when the file cannot be opened as a SQLite database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("opening handle database {}", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("setting busy timeout")?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    /// All distinct handles under a prefix, in lexicographic order.
    ///
    /// # Errors
    /// Fails on query or row-decoding errors.
    pub fn handles_under_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT handle FROM handles WHERE handle LIKE ?1 ORDER BY handle")
            .context("preparing prefix query")?;
        let rows = stmt
            .query_map([format!("{prefix}/%")], |row| row.get::<_, String>(0))
            .context("querying handles by prefix")?;
        let mut handles = Vec::new();
        for row in rows {
            handles.push(row.context("decoding handle row")?);
        }
        Ok(handles)
    }

    /// All field rows of one record, ordered by field index. An unknown
    /// handle yields an empty list, indistinguishable from an empty record.
    ///
    /// # Errors
    /// Fails on query or row-decoding errors.
    pub fn record_fields(&self, handle: &str) -> Result<Vec<RawField>> {
        let mut stmt = self
            .conn
            .prepare("SELECT idx, type, data, timestamp FROM handles WHERE handle = ?1 ORDER BY idx")
            .context("preparing record query")?;
        let rows = stmt
            .query_map([handle], |row| {
                Ok(RawField {
                    index: row.get(0)?,
                    field_type: row.get(1)?,
                    value: row.get(2)?,
                    timestamp: row.get(3)?,
                })
            })
            .with_context(|| format!("querying fields of {handle}"))?;
        let mut fields = Vec::new();
        for row in rows {
            fields.push(row.with_context(|| format!("decoding field row of {handle}"))?);
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store() -> HandleStore {
        let conn = match Connection::open_in_memory() {
            Ok(conn) => conn,
            Err(err) => panic!("in-memory database should open: {err}"),
        };
        let setup = "
            CREATE TABLE handles (
                handle TEXT NOT NULL,
                idx INTEGER NOT NULL,
                type TEXT NOT NULL,
                data TEXT NOT NULL,
                timestamp INTEGER
            );
            INSERT INTO handles VALUES ('21.T12995/b', 2, 'CHECKSUM', 'abc123', 1000000000);
            INSERT INTO handles VALUES ('21.T12995/b', 1, 'URL', 'http://x/data', 1000000000);
            INSERT INTO handles VALUES ('21.T12995/a', 1, 'URL', 'http://y/data', NULL);
            INSERT INTO handles VALUES ('11500/other', 1, 'URL', 'http://z/data', NULL);
        ";
        if let Err(err) = conn.execute_batch(setup) {
            panic!("fixture schema should apply: {err}");
        }
        HandleStore::from_connection(conn)
    }

    #[test]
    fn prefix_query_is_scoped_and_ordered() {
        let store = seeded_store();
        let handles = match store.handles_under_prefix("21.T12995") {
            Ok(handles) => handles,
            Err(err) => panic!("prefix query should succeed: {err}"),
        };
        assert_eq!(handles, vec!["21.T12995/a", "21.T12995/b"]);
    }

    #[test]
    fn record_fields_come_back_in_index_order() {
        let store = seeded_store();
        let fields = match store.record_fields("21.T12995/b") {
            Ok(fields) => fields,
            Err(err) => panic!("record query should succeed: {err}"),
        };
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].field_type, "URL");
        assert_eq!(fields[1].field_type, "CHECKSUM");
        assert_eq!(fields[1].timestamp, Some(1_000_000_000));
    }

    #[test]
    fn unknown_handle_yields_an_empty_record() {
        let store = seeded_store();
        let fields = match store.record_fields("21.T12995/missing") {
            Ok(fields) => fields,
            Err(err) => panic!("record query should succeed: {err}"),
        };
        assert!(fields.is_empty());
    }
}
