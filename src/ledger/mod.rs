use std::{
    fmt,
    path::Path,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize, Serializer};

mod queries;
mod schema;

pub use queries::{ensure_user, fetch_user, redemptions_for, top_users, totals};
pub use schema::init_schema;

pub type UserId = i64;
pub type Amount = u64;

pub const POINT_SCALE: u64 = 100; // 1 point = 100 minimal units

/// Upper bound on how long a writer waits for another process to release the
/// database lock.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("store failure: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("ledger connection lock poisoned")]
    Poisoned,
    #[error("unknown user {user}")]
    UnknownUser { user: UserId },
}

/// A balance expressed in minimal units, rendered as points with two decimals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Points(pub Amount);

impl Points {
    pub fn from_whole(points: u64) -> Self {
        Points(points * POINT_SCALE)
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / POINT_SCALE as f64
    }
}

impl fmt::Display for Points {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / POINT_SCALE, self.0 % POINT_SCALE)
    }
}

impl Serialize for Points {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(self.as_f64())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub handle: Option<String>,
    pub balance: Amount,
    pub inviter: Option<UserId>,
    pub referral_count: u32,
    pub referral_message_count: u64,
}

impl User {
    pub fn balance_points(&self) -> Points {
        Points(self.balance)
    }

    /// `@handle` when known, otherwise a label built from the numeric id.
    pub fn display_label(&self) -> String {
        match self.handle.as_deref() {
            Some(handle) if !handle.is_empty() => format!("@{handle}"),
            _ => format!("Пользователь {}", self.id),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Redemption {
    pub id: i64,
    pub user: UserId,
    pub amount: Amount,
    pub destination: String,
    pub created_at: i64,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq, Default)]
pub struct LedgerTotals {
    pub users: u64,
    pub referrals: u64,
    pub redemptions: u64,
    pub total_balance: Amount,
}

/// Shared handle to the ledger database.
///
/// Every mutation goes through [`Ledger::unit_of_work`], which holds the
/// process-wide connection lock and an `IMMEDIATE` SQLite transaction for the
/// duration of the closure. Other processes sharing the file serialize on the
/// database write lock.
#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, LedgerError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `work` inside a single transaction.
    ///
    /// The transaction commits only when `work` returns `Ok`. An `Err` (or a
    /// panic) drops the transaction, which rolls it back.
    pub fn unit_of_work<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<LedgerError>,
    {
        let mut conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(LedgerError::from)?;
        let value = work(&tx)?;
        tx.commit().map_err(LedgerError::from)?;
        Ok(value)
    }

    /// Runs a read-only query against the current committed state.
    pub fn read<T, F>(&self, query: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Connection) -> Result<T, LedgerError>,
    {
        let conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        query(&conn)
    }

    pub fn ensure_user(&self, id: UserId, handle: Option<&str>) -> Result<User, LedgerError> {
        self.unit_of_work(|tx| ensure_user(tx, id, handle))
    }

    pub fn read_user(&self, id: UserId) -> Result<Option<User>, LedgerError> {
        self.read(|conn| fetch_user(conn, id))
    }

    pub fn top_users(&self, limit: usize) -> Result<Vec<User>, LedgerError> {
        self.read(|conn| top_users(conn, limit))
    }

    pub fn totals(&self) -> Result<LedgerTotals, LedgerError> {
        self.read(totals)
    }

    pub fn redemptions_for(&self, user: UserId) -> Result<Vec<Redemption>, LedgerError> {
        self.read(|conn| redemptions_for(conn, user))
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn points_render_with_two_decimals() {
        assert_eq!(Points(1_502).to_string(), "15.02");
        assert_eq!(Points(2).to_string(), "0.02");
        assert_eq!(Points::from_whole(20).to_string(), "20.00");
        assert_eq!(serde_json::to_string(&Points(1_550)).unwrap(), "15.5");
    }

    #[test]
    fn ensure_user_creates_once_and_tracks_latest_handle() {
        let ledger = Ledger::open_in_memory().unwrap();
        let created = ledger.ensure_user(7, Some("alice")).unwrap();
        assert_eq!(created.balance, 0);
        assert_eq!(created.inviter, None);
        assert_eq!(created.handle.as_deref(), Some("alice"));

        ledger.ensure_user(7, None).unwrap();
        ledger.ensure_user(7, Some("")).unwrap();
        assert_eq!(
            ledger.read_user(7).unwrap().unwrap().handle.as_deref(),
            Some("alice")
        );

        ledger.ensure_user(7, Some("alice_new")).unwrap();
        assert_eq!(
            ledger.read_user(7).unwrap().unwrap().handle.as_deref(),
            Some("alice_new")
        );
        assert_eq!(ledger.totals().unwrap().users, 1);
    }

    #[test]
    fn read_user_reports_absence() {
        let ledger = Ledger::open_in_memory().unwrap();
        assert!(ledger.read_user(99).unwrap().is_none());
    }

    #[test]
    fn failed_unit_of_work_rolls_back() {
        let ledger = Ledger::open_in_memory().unwrap();
        let result: Result<(), LedgerError> = ledger.unit_of_work(|tx| {
            ensure_user(tx, 1, Some("ghost"))?;
            Err(LedgerError::UnknownUser { user: 1 })
        });
        assert!(result.is_err());
        assert!(ledger.read_user(1).unwrap().is_none());
    }

    #[test]
    fn top_users_orders_by_balance_then_referrals_then_id() {
        let ledger = Ledger::open_in_memory().unwrap();
        for id in 1..=4 {
            ledger.ensure_user(id, None).unwrap();
        }
        ledger
            .unit_of_work(|tx| {
                tx.execute("UPDATE users SET balance = 500 WHERE id IN (2, 3, 4)", [])?;
                tx.execute("UPDATE users SET referral_count = 3 WHERE id = 4", [])?;
                Ok::<_, LedgerError>(())
            })
            .unwrap();
        let order: Vec<UserId> = ledger
            .top_users(10)
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(order, vec![4, 2, 3, 1]);
        assert_eq!(ledger.top_users(2).unwrap().len(), 2);
    }

    #[test]
    fn display_label_falls_back_to_id() {
        let ledger = Ledger::open_in_memory().unwrap();
        let anon = ledger.ensure_user(5, None).unwrap();
        let named = ledger.ensure_user(6, Some("bob")).unwrap();
        assert_eq!(anon.display_label(), "Пользователь 5");
        assert_eq!(named.display_label(), "@bob");
    }
}
