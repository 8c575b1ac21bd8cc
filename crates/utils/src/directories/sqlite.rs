use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{debug, info};

use crate::{
    directory::{Directory, DirectoryFuture, GroupRecord},
    DirectoryError, DirectoryResult, GroupKey, Member, MembershipState, Transition,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS members (
    domain TEXT NOT NULL,
    grp TEXT NOT NULL,
    alias TEXT NOT NULL,
    mailbox TEXT NOT NULL,
    PRIMARY KEY (domain, grp, alias)
);
CREATE TABLE IF NOT EXISTS markers (
    domain TEXT NOT NULL,
    grp TEXT NOT NULL,
    address TEXT NOT NULL,
    kind TEXT NOT NULL,
    PRIMARY KEY (domain, grp, address)
);
";

const DECLINED: &str = "declined";
const REFUSED: &str = "refused";

impl From<rusqlite::Error> for DirectoryError {
    fn from(e: rusqlite::Error) -> Self {
        DirectoryError::Storage(e.to_string())
    }
}

/// Directory persisting groups in a SQLite database file.
///
/// Every call opens its own connection on the blocking thread pool,
/// transitions run inside an immediate transaction so that concurrent
/// writers (even from other processes) are serialized.
#[derive(Debug, Clone)]
pub struct SqliteDirectory {
    path: PathBuf,
}

impl SqliteDirectory {
    /// Opens (creating if needed) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> DirectoryResult<Self> {
        let directory = Self {
            path: path.as_ref().to_path_buf(),
        };
        directory
            .blocking(|conn| Ok(conn.execute_batch(SCHEMA)?))
            .await?;
        info!(path = %directory.path.display(), "SQLite directory initialized");
        Ok(directory)
    }

    async fn blocking<T, F>(&self, f: F) -> DirectoryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> DirectoryResult<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| DirectoryError::Storage(e.to_string()))?
    }
}

fn load_record(conn: &Connection, group: &GroupKey) -> DirectoryResult<GroupRecord> {
    let mut record = GroupRecord::default();

    let mut stmt = conn.prepare("SELECT alias, mailbox FROM members WHERE domain = ?1 AND grp = ?2")?;
    let rows = stmt.query_map(params![group.domain, group.name], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (alias, mailbox) = row?;
        record.members.insert(alias, mailbox);
    }

    let mut stmt = conn.prepare("SELECT address, kind FROM markers WHERE domain = ?1 AND grp = ?2")?;
    let rows = stmt.query_map(params![group.domain, group.name], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (address, kind) = row?;
        match kind.as_str() {
            DECLINED => record.declined.insert(address),
            REFUSED => record.refused.insert(address),
            _ => false,
        };
    }
    Ok(record)
}

/// Rewrites the rows of one address from the given record.
fn store_address(
    conn: &Connection,
    group: &GroupKey,
    address: &str,
    record: &GroupRecord,
) -> DirectoryResult<()> {
    conn.execute(
        "DELETE FROM members WHERE domain = ?1 AND grp = ?2 AND mailbox = ?3",
        params![group.domain, group.name, address],
    )?;
    conn.execute(
        "DELETE FROM markers WHERE domain = ?1 AND grp = ?2 AND address = ?3",
        params![group.domain, group.name, address],
    )?;
    if let Some(alias) = record.alias_of(address) {
        conn.execute(
            "INSERT INTO members (domain, grp, alias, mailbox) VALUES (?1, ?2, ?3, ?4)",
            params![group.domain, group.name, alias, address],
        )?;
    }
    let kind = if record.refused.contains(address) {
        Some(REFUSED)
    } else if record.declined.contains(address) {
        Some(DECLINED)
    } else {
        None
    };
    if let Some(kind) = kind {
        conn.execute(
            "INSERT INTO markers (domain, grp, address, kind) VALUES (?1, ?2, ?3, ?4)",
            params![group.domain, group.name, address, kind],
        )?;
    }
    Ok(())
}

impl Directory for SqliteDirectory {
    fn get_state<'a>(
        &'a self,
        group: &'a GroupKey,
        address: &'a str,
    ) -> DirectoryFuture<'a, MembershipState> {
        let group = group.clone();
        let address = address.to_string();
        Box::pin(self.blocking(move |conn| Ok(load_record(conn, &group)?.state(&address))))
    }

    fn alias_owner<'a>(
        &'a self,
        group: &'a GroupKey,
        alias: &'a str,
    ) -> DirectoryFuture<'a, Option<String>> {
        let group = group.clone();
        let alias = alias.to_string();
        Box::pin(self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT mailbox FROM members WHERE domain = ?1 AND grp = ?2 AND alias = ?3",
            )?;
            let mut rows = stmt.query(params![group.domain, group.name, alias])?;
            let owner = match rows.next()? {
                Some(row) => Some(row.get::<_, String>(0)?),
                None => None,
            };
            Ok(owner)
        }))
    }

    fn members<'a>(&'a self, group: &'a GroupKey) -> DirectoryFuture<'a, Vec<Member>> {
        let group = group.clone();
        Box::pin(self.blocking(move |conn| Ok(load_record(conn, &group)?.members())))
    }

    fn apply<'a>(
        &'a self,
        group: &'a GroupKey,
        address: &'a str,
        transition: Transition,
    ) -> DirectoryFuture<'a, ()> {
        let group = group.clone();
        let address = address.to_string();
        Box::pin(self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut record = load_record(&tx, &group)?;
            record.apply_all(&[(address.clone(), transition.clone())])?;
            store_address(&tx, &group, &address, &record)?;
            tx.commit()?;
            debug!(
                group = %group,
                address = %address,
                transition = transition.name(),
                "Applied transition in SQLite"
            );
            Ok(())
        }))
    }

    fn apply_batch<'a>(
        &'a self,
        group: &'a GroupKey,
        changes: Vec<(String, Transition)>,
    ) -> DirectoryFuture<'a, ()> {
        let group = group.clone();
        Box::pin(self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut record = load_record(&tx, &group)?;
            record.apply_all(&changes)?;
            for (address, _) in &changes {
                store_address(&tx, &group, address, &record)?;
            }
            tx.commit()?;
            debug!(group = %group, changes = changes.len(), "Applied batch in SQLite");
            Ok(())
        }))
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}
