// src/db.rs
use crate::cell::TonAddress;
use crate::models::{AssetLeg, Log, PendingOperation, Principals, ProjectionJob, TxHash, TxMarker, UserSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{eyre, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::task;

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS transactions (
  hash    TEXT PRIMARY KEY,
  lt      INTEGER NOT NULL,
  utime   INTEGER NOT NULL,
  seen_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS logs (
  id                     INTEGER PRIMARY KEY AUTOINCREMENT,
  hash                   TEXT UNIQUE NOT NULL,
  utime                  INTEGER NOT NULL,
  kind                   TEXT NOT NULL CHECK (kind IN ('supply','withdraw','liquidate')),
  sender_address         TEXT NOT NULL,
  user_address           TEXT NOT NULL,
  attached_asset_id      TEXT, -- u256 as decimal string
  attached_amount        TEXT, -- u64 as decimal string
  attached_principal     INTEGER,
  attached_total_supply  INTEGER,
  attached_total_borrow  INTEGER,
  attached_s_rate        TEXT,
  attached_b_rate        TEXT,
  redeemed_asset_id      TEXT,
  redeemed_amount        TEXT,
  redeemed_principal     INTEGER,
  redeemed_total_supply  INTEGER,
  redeemed_total_borrow  INTEGER,
  redeemed_s_rate        TEXT,
  redeemed_b_rate        TEXT,
  processed              INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS operations (
  id               INTEGER PRIMARY KEY AUTOINCREMENT,
  lt               INTEGER NOT NULL,
  contract_address TEXT NOT NULL,
  opcode           INTEGER NOT NULL,
  raw_body         TEXT NOT NULL,
  event_id         INTEGER NOT NULL,
  event_utime      INTEGER NOT NULL,
  created_at       TEXT NOT NULL,
  UNIQUE(lt, raw_body)
);

CREATE TABLE IF NOT EXISTS users (
  contract_address TEXT PRIMARY KEY,
  wallet_address   TEXT NOT NULL,
  code_version     INTEGER NOT NULL,
  created_at       INTEGER NOT NULL,
  updated_at       INTEGER NOT NULL,
  principals       TEXT NOT NULL, -- ordered [["asset id", principal], ...]
  state            INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS projection_queue (
  contract_address TEXT PRIMARY KEY,
  due_at           INTEGER NOT NULL, -- unix ms
  first_event      INTEGER NOT NULL,
  last_event       INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS walker_state (
  account   TEXT PRIMARY KEY,
  before_lt INTEGER
);
"#;

const LOG_COLUMNS: &str = "id, hash, utime, kind, sender_address, user_address, \
    attached_asset_id, attached_amount, attached_principal, attached_total_supply, \
    attached_total_borrow, attached_s_rate, attached_b_rate, \
    redeemed_asset_id, redeemed_amount, redeemed_principal, redeemed_total_supply, \
    redeemed_total_borrow, redeemed_s_rate, redeemed_b_rate, processed";

const OPERATION_COLUMNS: &str =
    "id, lt, contract_address, opcode, raw_body, event_id, event_utime, created_at";

const USER_COLUMNS: &str =
    "contract_address, wallet_address, code_version, created_at, updated_at, principals, state";

/// Persistence gateway. Every call is one atomic write or read.
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns `true` when the transaction had already been recorded.
    async fn mark_transaction_seen(&self, tx: &TxMarker) -> Result<bool>;
    async fn has_transaction(&self, hash: &TxHash) -> Result<bool>;

    /// `None` when an event for the same transaction already exists.
    async fn append_event(&self, event: &Log) -> Result<Option<i64>>;
    async fn find_event_by_hash(&self, hash: &TxHash) -> Result<Option<Log>>;
    async fn delete_event(&self, id: i64) -> Result<()>;
    async fn mark_event_processed(&self, id: i64) -> Result<()>;
    async fn list_unprocessed_events(&self) -> Result<Vec<Log>>;
    async fn list_events(&self, limit: u32, unprocessed_only: bool) -> Result<Vec<Log>>;

    async fn get_user_snapshot(&self, contract: &TonAddress) -> Result<Option<UserSnapshot>>;
    async fn insert_user_snapshot(&self, snapshot: &UserSnapshot) -> Result<()>;
    /// Overwrites balances, keeps the earliest `created_at` and latest `updated_at`.
    async fn merge_user_snapshot(&self, snapshot: &UserSnapshot) -> Result<()>;

    async fn add_pending_operation(&self, op: &PendingOperation) -> Result<i64>;
    async fn find_pending_operation(&self, lt: u64, raw_body: &str) -> Result<Option<PendingOperation>>;
    async fn list_pending_operations(&self) -> Result<Vec<PendingOperation>>;
    async fn remove_pending_operation(&self, id: i64) -> Result<()>;

    /// Upsert: a queued contract keeps the later due time and the widest event range.
    async fn enqueue_projection(&self, job: &ProjectionJob) -> Result<()>;
    async fn due_projections(&self, now_ms: i64) -> Result<Vec<ProjectionJob>>;
    /// No-op when the job was re-enqueued after being read, including a
    /// re-enqueue that only widened the event range.
    async fn complete_projection(&self, job: &ProjectionJob) -> Result<()>;

    async fn load_walk_cursor(&self, account: &TonAddress) -> Result<Option<u64>>;
    async fn save_walk_cursor(&self, account: &TonAddress, before_lt: Option<u64>) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (with WAL mode for performance) and migrate
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_schema(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_schema(Connection::open_in_memory()?)
    }

    fn with_schema(conn: Connection) -> Result<Self> {
        conn.execute_batch(INIT_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let db = conn.lock().map_err(|_| eyre!("database mutex poisoned"))?;
            f(&db)
        })
        .await?
    }
}

fn sql_int(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| eyre!("{what} {value} does not fit in an SQLite integer"))
}

fn parse_col<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn text_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    parse_col(idx, &raw)
}

fn read_leg(row: &Row<'_>, base: usize) -> rusqlite::Result<Option<AssetLeg>> {
    let Some(asset_id) = row.get::<_, Option<String>>(base)? else {
        return Ok(None);
    };
    Ok(Some(AssetLeg {
        asset_id: parse_col(base, &asset_id)?,
        amount: text_col(row, base + 1)?,
        principal: row.get(base + 2)?,
        total_supply_principal: row.get(base + 3)?,
        total_borrow_principal: row.get(base + 4)?,
        s_rate: text_col(row, base + 5)?,
        b_rate: text_col(row, base + 6)?,
    }))
}

fn read_log(row: &Row<'_>) -> rusqlite::Result<Log> {
    Ok(Log {
        id: Some(row.get(0)?),
        hash: text_col(row, 1)?,
        utime: row.get::<_, i64>(2)? as u64,
        kind: text_col(row, 3)?,
        sender_address: text_col(row, 4)?,
        user_address: text_col(row, 5)?,
        attached: read_leg(row, 6)?,
        redeemed: read_leg(row, 13)?,
        processed: row.get(20)?,
    })
}

fn read_operation(row: &Row<'_>) -> rusqlite::Result<PendingOperation> {
    let created_at: String = row.get(7)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
    Ok(PendingOperation {
        id: Some(row.get(0)?),
        lt: row.get::<_, i64>(1)? as u64,
        contract_address: text_col(row, 2)?,
        opcode: row.get::<_, i64>(3)? as u32,
        raw_body: row.get(4)?,
        event_id: row.get(5)?,
        event_utime: row.get::<_, i64>(6)? as u64,
        created_at,
    })
}

fn read_user(row: &Row<'_>) -> rusqlite::Result<(UserSnapshot, String)> {
    let principals: String = row.get(5)?;
    Ok((
        UserSnapshot {
            contract_address: text_col(row, 0)?,
            wallet_address: text_col(row, 1)?,
            code_version: row.get::<_, i64>(2)? as u32,
            created_at: row.get::<_, i64>(3)? as u64,
            updated_at: row.get::<_, i64>(4)? as u64,
            principals: Principals::default(),
            state: row.get(6)?,
        },
        principals,
    ))
}

fn read_job(row: &Row<'_>) -> rusqlite::Result<ProjectionJob> {
    Ok(ProjectionJob {
        contract_address: text_col(row, 0)?,
        due_at: row.get(1)?,
        first_event: row.get::<_, i64>(2)? as u64,
        last_event: row.get::<_, i64>(3)? as u64,
    })
}

type LegColumns = (
    Option<String>,
    Option<String>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<String>,
    Option<String>,
);

fn leg_values(leg: Option<&AssetLeg>) -> LegColumns {
    (
        leg.map(|l| l.asset_id.to_string()),
        leg.map(|l| l.amount.to_string()),
        leg.map(|l| l.principal),
        leg.map(|l| l.total_supply_principal),
        leg.map(|l| l.total_borrow_principal),
        leg.map(|l| l.s_rate.to_string()),
        leg.map(|l| l.b_rate.to_string()),
    )
}

#[async_trait]
impl Store for SqliteStore {
    async fn mark_transaction_seen(&self, tx: &TxMarker) -> Result<bool> {
        let hash = tx.hash.to_string();
        let lt = sql_int(tx.lt, "lt")?;
        let utime = sql_int(tx.utime, "utime")?;
        self.call(move |db| {
            let inserted = db.execute(
                "INSERT INTO transactions (hash, lt, utime) VALUES (?1, ?2, ?3)
                 ON CONFLICT(hash) DO NOTHING",
                params![hash, lt, utime],
            )?;
            Ok(inserted == 0)
        })
        .await
    }

    async fn has_transaction(&self, hash: &TxHash) -> Result<bool> {
        let hash = hash.to_string();
        self.call(move |db| {
            let found = db
                .query_row("SELECT 1 FROM transactions WHERE hash = ?1", [hash], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn append_event(&self, event: &Log) -> Result<Option<i64>> {
        let event = event.clone();
        let utime = sql_int(event.utime, "utime")?;
        self.call(move |db| {
            let a = leg_values(event.attached.as_ref());
            let r = leg_values(event.redeemed.as_ref());
            let inserted = db.execute(
                &format!(
                    "INSERT INTO logs ({LOG_COLUMNS})
                     VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                             ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
                     ON CONFLICT(hash) DO NOTHING"
                ),
                params![
                    event.hash.to_string(),
                    utime,
                    event.kind.as_str(),
                    event.sender_address.to_string(),
                    event.user_address.to_string(),
                    a.0, a.1, a.2, a.3, a.4, a.5, a.6,
                    r.0, r.1, r.2, r.3, r.4, r.5, r.6,
                    event.processed,
                ],
            )?;
            Ok((inserted > 0).then(|| db.last_insert_rowid()))
        })
        .await
    }

    async fn find_event_by_hash(&self, hash: &TxHash) -> Result<Option<Log>> {
        let hash = hash.to_string();
        self.call(move |db| {
            let found = db
                .query_row(
                    &format!("SELECT {LOG_COLUMNS} FROM logs WHERE hash = ?1"),
                    [hash],
                    read_log,
                )
                .optional()?;
            Ok(found)
        })
        .await
    }

    async fn delete_event(&self, id: i64) -> Result<()> {
        self.call(move |db| {
            db.execute("DELETE FROM logs WHERE id = ?1", [id])?;
            Ok(())
        })
        .await
    }

    async fn mark_event_processed(&self, id: i64) -> Result<()> {
        self.call(move |db| {
            let updated = db.execute("UPDATE logs SET processed = 1 WHERE id = ?1", [id])?;
            if updated == 0 {
                return Err(eyre!("event {id} not found"));
            }
            Ok(())
        })
        .await
    }

    async fn list_unprocessed_events(&self) -> Result<Vec<Log>> {
        self.call(|db| {
            let mut stmt = db.prepare(&format!(
                "SELECT {LOG_COLUMNS} FROM logs WHERE processed = 0 ORDER BY id"
            ))?;
            let rows = stmt.query_map([], read_log)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn list_events(&self, limit: u32, unprocessed_only: bool) -> Result<Vec<Log>> {
        self.call(move |db| {
            let mut stmt = db.prepare(&format!(
                "SELECT {LOG_COLUMNS} FROM logs
                 WHERE (?1 = 0 OR processed = 0)
                 ORDER BY utime DESC, id DESC
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![unprocessed_only, limit as i64], read_log)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn get_user_snapshot(&self, contract: &TonAddress) -> Result<Option<UserSnapshot>> {
        let contract = contract.to_string();
        self.call(move |db| {
            let row = db
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE contract_address = ?1"),
                    [contract],
                    read_user,
                )
                .optional()?;
            match row {
                Some((mut snapshot, principals)) => {
                    snapshot.principals = Principals::from_json(&principals)?;
                    Ok(Some(snapshot))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn insert_user_snapshot(&self, snapshot: &UserSnapshot) -> Result<()> {
        let s = snapshot.clone();
        let created_at = sql_int(s.created_at, "created_at")?;
        let updated_at = sql_int(s.updated_at, "updated_at")?;
        self.call(move |db| {
            db.execute(
                &format!("INSERT INTO users ({USER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    s.contract_address.to_string(),
                    s.wallet_address.to_string(),
                    s.code_version,
                    created_at,
                    updated_at,
                    s.principals.to_json(),
                    s.state,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn merge_user_snapshot(&self, snapshot: &UserSnapshot) -> Result<()> {
        let s = snapshot.clone();
        let created_at = sql_int(s.created_at, "created_at")?;
        let updated_at = sql_int(s.updated_at, "updated_at")?;
        self.call(move |db| {
            let updated = db.execute(
                "UPDATE users SET
                    wallet_address = ?2,
                    code_version   = ?3,
                    created_at     = MIN(created_at, ?4),
                    updated_at     = MAX(updated_at, ?5),
                    principals     = ?6,
                    state          = ?7
                 WHERE contract_address = ?1",
                params![
                    s.contract_address.to_string(),
                    s.wallet_address.to_string(),
                    s.code_version,
                    created_at,
                    updated_at,
                    s.principals.to_json(),
                    s.state,
                ],
            )?;
            if updated == 0 {
                return Err(eyre!("no snapshot for {}", s.contract_address));
            }
            Ok(())
        })
        .await
    }

    async fn add_pending_operation(&self, op: &PendingOperation) -> Result<i64> {
        let op = op.clone();
        let lt = sql_int(op.lt, "lt")?;
        let event_utime = sql_int(op.event_utime, "event_utime")?;
        self.call(move |db| {
            db.execute(
                "INSERT INTO operations (lt, contract_address, opcode, raw_body, event_id, event_utime, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(lt, raw_body) DO NOTHING",
                params![
                    lt,
                    op.contract_address.to_string(),
                    op.opcode,
                    op.raw_body,
                    op.event_id,
                    event_utime,
                    op.created_at.to_rfc3339(),
                ],
            )?;
            let id = db.query_row(
                "SELECT id FROM operations WHERE lt = ?1 AND raw_body = ?2",
                params![lt, op.raw_body],
                |r| r.get(0),
            )?;
            Ok(id)
        })
        .await
    }

    async fn find_pending_operation(&self, lt: u64, raw_body: &str) -> Result<Option<PendingOperation>> {
        let lt = sql_int(lt, "lt")?;
        let raw_body = raw_body.to_string();
        self.call(move |db| {
            Ok(db
                .query_row(
                    &format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE lt = ?1 AND raw_body = ?2"),
                    params![lt, raw_body],
                    read_operation,
                )
                .optional()?)
        })
        .await
    }

    async fn list_pending_operations(&self) -> Result<Vec<PendingOperation>> {
        self.call(|db| {
            let mut stmt = db.prepare(&format!("SELECT {OPERATION_COLUMNS} FROM operations ORDER BY id"))?;
            let rows = stmt.query_map([], read_operation)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn remove_pending_operation(&self, id: i64) -> Result<()> {
        self.call(move |db| {
            db.execute("DELETE FROM operations WHERE id = ?1", [id])?;
            Ok(())
        })
        .await
    }

    async fn enqueue_projection(&self, job: &ProjectionJob) -> Result<()> {
        let job = job.clone();
        let first = sql_int(job.first_event, "first_event")?;
        let last = sql_int(job.last_event, "last_event")?;
        self.call(move |db| {
            db.execute(
                "INSERT INTO projection_queue (contract_address, due_at, first_event, last_event)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(contract_address) DO UPDATE SET
                    due_at      = MAX(due_at, excluded.due_at),
                    first_event = MIN(first_event, excluded.first_event),
                    last_event  = MAX(last_event, excluded.last_event)",
                params![job.contract_address.to_string(), job.due_at, first, last],
            )?;
            Ok(())
        })
        .await
    }

    async fn due_projections(&self, now_ms: i64) -> Result<Vec<ProjectionJob>> {
        self.call(move |db| {
            let mut stmt = db.prepare(
                "SELECT contract_address, due_at, first_event, last_event
                 FROM projection_queue WHERE due_at <= ?1 ORDER BY due_at",
            )?;
            let rows = stmt.query_map([now_ms], read_job)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn complete_projection(&self, job: &ProjectionJob) -> Result<()> {
        let contract = job.contract_address.to_string();
        let due_at = job.due_at;
        let first = sql_int(job.first_event, "first_event")?;
        let last = sql_int(job.last_event, "last_event")?;
        self.call(move |db| {
            db.execute(
                "DELETE FROM projection_queue
                 WHERE contract_address = ?1 AND due_at = ?2 AND first_event = ?3 AND last_event = ?4",
                params![contract, due_at, first, last],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_walk_cursor(&self, account: &TonAddress) -> Result<Option<u64>> {
        let account = account.to_string();
        self.call(move |db| {
            let lt: Option<Option<i64>> = db
                .query_row(
                    "SELECT before_lt FROM walker_state WHERE account = ?1",
                    [account],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(lt.flatten().map(|lt| lt as u64))
        })
        .await
    }

    async fn save_walk_cursor(&self, account: &TonAddress, before_lt: Option<u64>) -> Result<()> {
        let account = account.to_string();
        let before_lt = before_lt.map(|lt| sql_int(lt, "before_lt")).transpose()?;
        self.call(move |db| {
            db.execute(
                "INSERT INTO walker_state (account, before_lt) VALUES (?1, ?2)
                 ON CONFLICT(account) DO UPDATE SET before_lt = excluded.before_lt",
                params![account, before_lt],
            )?;
            Ok(())
        })
        .await
    }
}
