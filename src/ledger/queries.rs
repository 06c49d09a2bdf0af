use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Amount, LedgerError, LedgerTotals, Redemption, User, UserId};

const USER_COLUMNS: &str =
    "id, handle, balance, inviter_id, referral_count, referral_message_count";

fn map_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        handle: row.get(1)?,
        balance: row.get::<_, i64>(2)? as Amount,
        inviter: row.get(3)?,
        referral_count: row.get::<_, i64>(4)? as u32,
        referral_message_count: row.get::<_, i64>(5)? as u64,
    })
}

/// Creates the user if absent and refreshes the handle when a new non-empty
/// one is supplied. Returns the stored row.
pub fn ensure_user(
    conn: &Connection,
    id: UserId,
    handle: Option<&str>,
) -> Result<User, LedgerError> {
    let handle = handle.map(str::trim).filter(|h| !h.is_empty());
    conn.execute(
        "INSERT OR IGNORE INTO users (id, handle) VALUES (?1, ?2)",
        params![id, handle],
    )?;
    if let Some(handle) = handle {
        conn.execute(
            "UPDATE users SET handle = ?2 WHERE id = ?1 AND (handle IS NULL OR handle <> ?2)",
            params![id, handle],
        )?;
    }
    fetch_user(conn, id)?.ok_or(LedgerError::UnknownUser { user: id })
}

pub fn fetch_user(conn: &Connection, id: UserId) -> Result<Option<User>, LedgerError> {
    let user = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![id],
            map_user,
        )
        .optional()?;
    Ok(user)
}

pub fn top_users(conn: &Connection, limit: usize) -> Result<Vec<User>, LedgerError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {USER_COLUMNS} FROM users
         ORDER BY balance DESC, referral_count DESC, id ASC
         LIMIT ?1"
    ))?;
    let rows = stmt.query_map(params![limit as i64], map_user)?;
    let mut users = Vec::new();
    for row in rows {
        users.push(row?);
    }
    Ok(users)
}

pub fn totals(conn: &Connection) -> Result<LedgerTotals, LedgerError> {
    let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |row| row.get(0)) };
    Ok(LedgerTotals {
        users: count("SELECT COUNT(*) FROM users")? as u64,
        referrals: count("SELECT COUNT(*) FROM referral_edges")? as u64,
        redemptions: count("SELECT COUNT(*) FROM redemptions")? as u64,
        total_balance: count("SELECT COALESCE(SUM(balance), 0) FROM users")? as Amount,
    })
}

pub fn redemptions_for(conn: &Connection, user: UserId) -> Result<Vec<Redemption>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, amount, destination, created_at
         FROM redemptions WHERE user_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![user], |row| {
        Ok(Redemption {
            id: row.get(0)?,
            user: row.get(1)?,
            amount: row.get::<_, i64>(2)? as Amount,
            destination: row.get(3)?,
            created_at: row.get(4)?,
        })
    })?;
    let mut redemptions = Vec::new();
    for row in rows {
        redemptions.push(row?);
    }
    Ok(redemptions)
}
