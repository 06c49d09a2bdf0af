//! Message-throttled reward accrual.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::ledger::{ensure_user, Amount, Ledger, LedgerError, UserId};

/// Minimum number of seconds between two counted messages of one user.
pub const COOLDOWN_SECS: i64 = 10;

/// Default credit per counted referral message: 0.02 points.
pub const MESSAGE_REWARD: Amount = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activity {
    Counted,
    NotCounted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccrualOutcome {
    Credited { inviter: UserId, amount: Amount },
    NoInviter,
    Throttled,
}

/// Debounces activity per user. The first activity always counts; after that
/// an activity counts only once `COOLDOWN_SECS` have passed since the last
/// counted one. Rejected activity leaves the stored state untouched.
pub fn register_activity(
    conn: &Connection,
    user: UserId,
    timestamp: i64,
) -> Result<Activity, LedgerError> {
    let last: Option<i64> = conn
        .query_row(
            "SELECT last_activity_at FROM throttle_state WHERE user_id = ?1",
            params![user],
            |row| row.get(0),
        )
        .optional()?;
    match last {
        None => {
            conn.execute(
                "INSERT INTO throttle_state (user_id, last_activity_at, counted_tally)
                 VALUES (?1, ?2, 1)",
                params![user, timestamp],
            )?;
            Ok(Activity::Counted)
        }
        Some(last) if timestamp.saturating_sub(last) < COOLDOWN_SECS => {
            Ok(Activity::NotCounted)
        }
        Some(_) => {
            conn.execute(
                "UPDATE throttle_state
                 SET last_activity_at = ?2, counted_tally = counted_tally + 1
                 WHERE user_id = ?1",
                params![user, timestamp],
            )?;
            Ok(Activity::Counted)
        }
    }
}

/// Adds `reward` to the inviter's balance and bumps their referral-message
/// tally. Returns false when the inviter does not exist.
pub fn accrue_reward(
    conn: &Connection,
    inviter: UserId,
    reward: Amount,
) -> Result<bool, LedgerError> {
    let changed = conn.execute(
        "UPDATE users
         SET balance = balance + ?2,
             referral_message_count = referral_message_count + 1
         WHERE id = ?1",
        params![inviter, reward as i64],
    )?;
    Ok(changed == 1)
}

/// Handles one qualifying group message from `user` in a single transaction.
pub fn record_message(
    conn: &Connection,
    user: UserId,
    handle: Option<&str>,
    timestamp: i64,
    reward: Amount,
) -> Result<AccrualOutcome, LedgerError> {
    let actor = ensure_user(conn, user, handle)?;
    let inviter = match actor.inviter {
        Some(inviter) if inviter != user => inviter,
        _ => return Ok(AccrualOutcome::NoInviter),
    };
    if register_activity(conn, user, timestamp)? == Activity::NotCounted {
        debug!(user, timestamp, "activity inside cool-down");
        return Ok(AccrualOutcome::Throttled);
    }
    if !accrue_reward(conn, inviter, reward)? {
        return Ok(AccrualOutcome::NoInviter);
    }
    info!(user, inviter, reward, "referral message credited");
    Ok(AccrualOutcome::Credited {
        inviter,
        amount: reward,
    })
}

pub struct AccrualService<'a> {
    ledger: &'a Ledger,
    reward: Amount,
}

impl<'a> AccrualService<'a> {
    pub fn new(ledger: &'a Ledger, reward: Amount) -> Self {
        Self { ledger, reward }
    }

    pub fn register_activity(&self, user: UserId, timestamp: i64) -> Result<Activity, LedgerError> {
        self.ledger
            .unit_of_work(|tx| register_activity(tx, user, timestamp))
    }

    pub fn accrue_reward(&self, inviter: UserId) -> Result<bool, LedgerError> {
        let reward = self.reward;
        self.ledger.unit_of_work(|tx| accrue_reward(tx, inviter, reward))
    }

    pub fn record_message(
        &self,
        user: UserId,
        handle: Option<&str>,
        timestamp: i64,
    ) -> Result<AccrualOutcome, LedgerError> {
        let reward = self.reward;
        self.ledger
            .unit_of_work(|tx| record_message(tx, user, handle, timestamp, reward))
    }
}
