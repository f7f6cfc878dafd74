use crate::schema::MIG_0001_INIT;
use anyhow::{bail, Context, Result};
use rusqlite::{Connection, OpenFlags};
use std::time::Duration;
use tracing::info;

pub struct Db {
    pub conn: Connection,
}

impl Db {
    pub fn open_or_create(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).with_context(|| format!("failed opening ledger {}", path.display()))?;
        apply_pragmas(&conn)?;
        migrate(&conn)?;
        Ok(Db { conn })
    }

    /// Open a ledger that must already exist. Never creates a file or tables.
    pub fn open_existing(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            bail!("ledger {} does not exist", path.display());
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX)
            .with_context(|| format!("failed opening ledger {}", path.display()))?;
        apply_pragmas(&conn)?;
        let db = Db { conn };
        if !db.table_exists("domains")? {
            bail!("{} is not a certhunter ledger", path.display());
        }
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_pragmas(&conn)?;
        migrate(&conn)?;
        Ok(Db { conn })
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", &"WAL")?;
    conn.pragma_update(None, "synchronous", &"NORMAL")?;
    conn.pragma_update(None, "foreign_keys", &"ON")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

fn migrate(conn: &Connection) -> Result<()> {
    // naive: if domains table doesn't exist, apply 0001
    let exists: i64 = conn.query_row(
        "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name='domains'",
        [],
        |r| r.get(0),
    )?;
    if exists == 0 {
        conn.execute_batch(MIG_0001_INIT).context("failed creating ledger tables")?;
        info!("ledger schema created");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_existing_does_not_create_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let err = Db::open_existing(&path).err().unwrap();
        assert!(err.to_string().contains("does not exist"));
        assert!(!path.exists());
    }

    #[test]
    fn open_existing_reads_a_created_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assets.db");
        {
            let db = Db::open_or_create(&path).unwrap();
            db.ensure_domain("example.com").unwrap();
        }
        let db = Db::open_existing(&path).unwrap();
        assert_eq!(db.counts().unwrap().domains, 1);
    }

    #[test]
    fn open_existing_rejects_foreign_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.db");
        Connection::open(&path).unwrap().execute_batch("CREATE TABLE notes(id INTEGER);").unwrap();
        let err = Db::open_existing(&path).err().unwrap();
        assert!(err.to_string().contains("not a certhunter ledger"));
    }
}
