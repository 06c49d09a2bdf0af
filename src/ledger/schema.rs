use rusqlite::Connection;

/// Creates every ledger table and index. Safe to run on every open.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id                      INTEGER PRIMARY KEY,
            handle                  TEXT,
            balance                 INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
            inviter_id              INTEGER REFERENCES users(id),
            referral_count          INTEGER NOT NULL DEFAULT 0,
            referral_message_count  INTEGER NOT NULL DEFAULT 0,
            CHECK (inviter_id IS NULL OR inviter_id <> id)
        );

        CREATE TABLE IF NOT EXISTS referral_edges (
            inviter_id  INTEGER NOT NULL REFERENCES users(id),
            invitee_id  INTEGER NOT NULL REFERENCES users(id),
            created_at  INTEGER NOT NULL,
            PRIMARY KEY (inviter_id, invitee_id),
            CHECK (inviter_id <> invitee_id)
        );

        CREATE TABLE IF NOT EXISTS throttle_state (
            user_id           INTEGER PRIMARY KEY,
            last_activity_at  INTEGER NOT NULL,
            counted_tally     INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS redemptions (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id      INTEGER NOT NULL REFERENCES users(id),
            amount       INTEGER NOT NULL CHECK (amount > 0),
            destination  TEXT NOT NULL,
            created_at   INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS invite_registry (
            user_id     INTEGER PRIMARY KEY REFERENCES users(id),
            handle      TEXT NOT NULL UNIQUE,
            created_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_users_balance ON users(balance DESC);
        CREATE INDEX IF NOT EXISTS idx_users_referrals ON users(referral_count DESC);
        CREATE INDEX IF NOT EXISTS idx_referral_edges_inviter ON referral_edges(inviter_id);
        CREATE INDEX IF NOT EXISTS idx_redemptions_user ON redemptions(user_id);
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('users', 'referral_edges', 'throttle_state', 'redemptions', 'invite_registry')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }

    #[test]
    fn self_inviter_is_rejected_by_the_store() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute("INSERT INTO users (id) VALUES (1)", []).unwrap();
        let err = conn.execute("UPDATE users SET inviter_id = 1 WHERE id = 1", []);
        assert!(err.is_err());
    }
}
