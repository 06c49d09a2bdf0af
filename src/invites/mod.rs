use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::gateway::GroupGateway;
use crate::ledger::{ensure_user, unix_now, Ledger, LedgerError, UserId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InviteLink {
    Existing(String),
    Issued(String),
    Unavailable { reason: String },
}

impl InviteLink {
    pub fn handle(&self) -> Option<&str> {
        match self {
            InviteLink::Existing(handle) | InviteLink::Issued(handle) => Some(handle),
            InviteLink::Unavailable { .. } => None,
        }
    }

    pub fn into_handle(self) -> Option<String> {
        match self {
            InviteLink::Existing(handle) | InviteLink::Issued(handle) => Some(handle),
            InviteLink::Unavailable { .. } => None,
        }
    }
}

pub fn registered_invite(conn: &Connection, user: UserId) -> Result<Option<String>, LedgerError> {
    let handle = conn
        .query_row(
            "SELECT handle FROM invite_registry WHERE user_id = ?1",
            params![user],
            |row| row.get(0),
        )
        .optional()?;
    Ok(handle)
}

/// Hands out one personal invite handle per user, creating it on first use.
pub struct InviteIssuer<'a, G: GroupGateway + ?Sized> {
    ledger: &'a Ledger,
    gateway: &'a G,
}

impl<'a, G: GroupGateway + ?Sized> InviteIssuer<'a, G> {
    pub fn new(ledger: &'a Ledger, gateway: &'a G) -> Self {
        Self { ledger, gateway }
    }

    /// Returns the user's registered handle, minting one through the gateway
    /// when none exists. Gateway failures yield [`InviteLink::Unavailable`].
    ///
    /// The gateway call runs outside any transaction. If two callers race,
    /// the first registration sticks and both get it back.
    pub fn get_or_create_invite(&self, user: UserId) -> Result<InviteLink, LedgerError> {
        if let Some(handle) = self.ledger.read(|conn| registered_invite(conn, user))? {
            return Ok(InviteLink::Existing(handle));
        }
        let minted = match self.gateway.create_invite(&format!("ref-{user}")) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(user, error = %err, "invite link unavailable");
                return Ok(InviteLink::Unavailable {
                    reason: err.to_string(),
                });
            }
        };
        let now = unix_now();
        self.ledger.unit_of_work(|tx| {
            ensure_user(tx, user, None)?;
            tx.execute(
                "INSERT OR IGNORE INTO invite_registry (user_id, handle, created_at)
                 VALUES (?1, ?2, ?3)",
                params![user, minted, now],
            )?;
            Ok(match registered_invite(tx, user)? {
                Some(stored) if stored == minted => {
                    info!(user, "invite link registered");
                    InviteLink::Issued(stored)
                }
                Some(stored) => InviteLink::Existing(stored),
                None => {
                    warn!(user, "minted invite handle already belongs to another user");
                    InviteLink::Unavailable {
                        reason: "invite handle collision".to_string(),
                    }
                }
            })
        })
    }
}
