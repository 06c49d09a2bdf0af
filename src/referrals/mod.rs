//! Referral attribution.
//!
//! Attribution happens in two steps. The *intent* is recorded when a user
//! first opens the bot with someone's referral argument; it only sets the
//! invitee's inviter reference. The referral is *confirmed* once the invitee
//! actually joins the tracked group, which creates the referral edge and bumps
//! the inviter's counter. Claims that never lead to a join never count.

use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::ledger::{ensure_user, fetch_user, unix_now, Ledger, LedgerError, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributionOutcome {
    Attributed,
    AlreadyAttributed,
    SelfReferral,
    UnknownInviter,
    UnknownInvitee,
}

impl AttributionOutcome {
    pub fn is_attributed(self) -> bool {
        matches!(self, AttributionOutcome::Attributed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    EdgeCreated { inviter: UserId },
    AlreadyCounted { inviter: UserId },
    NoInviter,
}

/// Sets `invitee`'s inviter reference if it is still empty.
///
/// The write is a compare-and-set on `inviter_id IS NULL`, so the first
/// successful writer wins and later claims are no-ops.
pub fn record_invite_intent(
    conn: &Connection,
    invitee: UserId,
    inviter: UserId,
) -> Result<AttributionOutcome, LedgerError> {
    if invitee == inviter {
        return Ok(AttributionOutcome::SelfReferral);
    }
    match fetch_user(conn, invitee)? {
        None => return Ok(AttributionOutcome::UnknownInvitee),
        Some(user) if user.inviter.is_some() => return Ok(AttributionOutcome::AlreadyAttributed),
        Some(_) => {}
    }
    if fetch_user(conn, inviter)?.is_none() {
        return Ok(AttributionOutcome::UnknownInviter);
    }
    let changed = conn.execute(
        "UPDATE users SET inviter_id = ?2
         WHERE id = ?1 AND inviter_id IS NULL
           AND EXISTS (SELECT 1 FROM users WHERE id = ?2)",
        params![invitee, inviter],
    )?;
    if changed == 1 {
        info!(invitee, inviter, "referral intent recorded");
        Ok(AttributionOutcome::Attributed)
    } else {
        Ok(AttributionOutcome::AlreadyAttributed)
    }
}

/// Confirms a pending referral when the invitee joins the tracked group.
///
/// Edge creation and the inviter's counter move together; re-joining hits the
/// edge's primary key and changes nothing.
pub fn confirm_on_join(
    conn: &Connection,
    invitee: UserId,
    handle: Option<&str>,
    now: i64,
) -> Result<JoinOutcome, LedgerError> {
    let user = ensure_user(conn, invitee, handle)?;
    let inviter = match user.inviter {
        Some(inviter) if inviter != invitee => inviter,
        _ => return Ok(JoinOutcome::NoInviter),
    };
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO referral_edges (inviter_id, invitee_id, created_at)
         VALUES (?1, ?2, ?3)",
        params![inviter, invitee, now],
    )?;
    if inserted == 0 {
        debug!(invitee, inviter, "referral edge already exists");
        return Ok(JoinOutcome::AlreadyCounted { inviter });
    }
    conn.execute(
        "UPDATE users SET referral_count = referral_count + 1 WHERE id = ?1",
        params![inviter],
    )?;
    info!(invitee, inviter, "referral confirmed");
    Ok(JoinOutcome::EdgeCreated { inviter })
}

/// Attribution operations bound to a ledger, one transaction per call.
pub struct ReferralService<'a> {
    ledger: &'a Ledger,
}

impl<'a> ReferralService<'a> {
    pub fn new(ledger: &'a Ledger) -> Self {
        Self { ledger }
    }

    pub fn record_invite_intent(
        &self,
        invitee: UserId,
        inviter: UserId,
    ) -> Result<AttributionOutcome, LedgerError> {
        self.ledger
            .unit_of_work(|tx| record_invite_intent(tx, invitee, inviter))
    }

    pub fn confirm_on_join(
        &self,
        invitee: UserId,
        handle: Option<&str>,
    ) -> Result<JoinOutcome, LedgerError> {
        let now = unix_now();
        self.ledger
            .unit_of_work(|tx| confirm_on_join(tx, invitee, handle, now))
    }
}
