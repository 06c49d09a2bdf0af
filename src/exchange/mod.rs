use rusqlite::{params, Connection};
use tracing::info;

use crate::ledger::{fetch_user, Amount, Ledger, LedgerError, Points, Redemption, UserId};

/// Accepted redemption steps, in whole points.
pub const DENOMINATIONS: [u64; 4] = [10, 20, 50, 100];

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("amount {0} is not an accepted denomination")]
    InvalidAmount(String),
    #[error("destination must not be empty")]
    EmptyDestination,
    #[error("unknown user {user}")]
    UnknownUser { user: UserId },
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: Points, requested: Points },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ExchangeError {
    /// True for failures caused by the request itself rather than the store.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, ExchangeError::Ledger(_))
    }
}

/// Maps a requested amount in points onto the allow-list. Fractional or
/// unlisted values are rejected.
pub fn denomination(points: f64) -> Result<Amount, ExchangeError> {
    DENOMINATIONS
        .iter()
        .find(|d| (**d as f64) == points)
        .map(|d| Points::from_whole(*d).0)
        .ok_or_else(|| ExchangeError::InvalidAmount(points.to_string()))
}

/// Debits `amount` and appends the matching redemption row. Both writes land
/// in the caller's transaction, so neither survives without the other.
pub fn exchange(
    conn: &Connection,
    user: UserId,
    amount: Amount,
    destination: &str,
    now: i64,
) -> Result<Redemption, ExchangeError> {
    if !DENOMINATIONS
        .iter()
        .any(|d| Points::from_whole(*d).0 == amount)
    {
        return Err(ExchangeError::InvalidAmount(Points(amount).to_string()));
    }
    let destination = destination.trim();
    if destination.is_empty() {
        return Err(ExchangeError::EmptyDestination);
    }
    let current = fetch_user(conn, user)?.ok_or(ExchangeError::UnknownUser { user })?;
    if current.balance < amount {
        return Err(ExchangeError::InsufficientFunds {
            balance: Points(current.balance),
            requested: Points(amount),
        });
    }
    let debited = conn
        .execute(
            "UPDATE users SET balance = balance - ?2 WHERE id = ?1 AND balance >= ?2",
            params![user, amount as i64],
        )
        .map_err(LedgerError::from)?;
    if debited != 1 {
        return Err(ExchangeError::InsufficientFunds {
            balance: Points(current.balance),
            requested: Points(amount),
        });
    }
    conn.execute(
        "INSERT INTO redemptions (user_id, amount, destination, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![user, amount as i64, destination, now],
    )
    .map_err(LedgerError::from)?;
    let redemption = Redemption {
        id: conn.last_insert_rowid(),
        user,
        amount,
        destination: destination.to_string(),
        created_at: now,
    };
    info!(
        user,
        amount = %Points(amount),
        redemption = redemption.id,
        "redemption recorded"
    );
    Ok(redemption)
}

pub struct ExchangeService<'a> {
    ledger: &'a Ledger,
}

impl<'a> ExchangeService<'a> {
    pub fn new(ledger: &'a Ledger) -> Self {
        Self { ledger }
    }

    pub fn exchange(
        &self,
        user: UserId,
        amount: Amount,
        destination: &str,
    ) -> Result<Redemption, ExchangeError> {
        let now = crate::ledger::unix_now();
        self.ledger
            .unit_of_work(|tx| exchange(tx, user, amount, destination, now))
    }
}
