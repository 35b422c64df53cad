use std::time::Duration;

use sqlx::{PgConnection, Pool, Postgres};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Stable 64-bit FNV-1a of the election id, used as the advisory lock key.
pub fn lock_key(election_id: &str) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in election_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash as i64
}

/// Session-level advisory lock. The lock lives as long as the dedicated
/// connection; dropping the guard closes it and releases leadership.
pub struct LeaderLock {
    conn: PgConnection,
    key: i64,
}

impl LeaderLock {
    pub async fn release(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .execute(&mut self.conn)
            .await?;
        info!("leadership released");
        Ok(())
    }
}

/// Blocks until the lock is held. Returns `None` if `shutdown` fires first.
pub async fn acquire(
    pool: &Pool<Postgres>,
    election_id: &str,
    retry_every: Duration,
    shutdown: &CancellationToken,
) -> Result<Option<LeaderLock>, sqlx::Error> {
    let key = lock_key(election_id);
    info!(election_id, "waiting for leadership");
    loop {
        // Detached so a held lock never returns to the pool.
        let mut conn = pool.acquire().await?.detach();
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut conn)
            .await?;
        if acquired {
            info!(election_id, "leadership acquired");
            return Ok(Some(LeaderLock { conn, key }));
        }
        drop(conn);
        debug!(election_id, "another instance is leader");
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            _ = tokio::time::sleep(retry_every) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_stable() {
        assert_eq!(lock_key("vm-controller"), lock_key("vm-controller"));
        assert_ne!(lock_key("vm-controller"), lock_key("vm-controller-2"));
        // FNV-1a offset basis for the empty string.
        assert_eq!(lock_key(""), 0xcbf2_9ce4_8422_2325_u64 as i64);
    }
}
