// src/client.rs
//! Thin async adapter over the Redis connection.
//!
//! One `ConnectionManager` (reconnecting with exponential backoff) serves
//! all scripted and pipelined traffic for a role; blocking pops get their
//! own dedicated connection because they monopolise the socket.

use crate::{Result, SwitchyardError};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::Client as RedisClient;
use tracing::{debug, warn};

/// Parsed `redis_version` from INFO, used to select script variants for
/// legacy servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion(pub u16, pub u16, pub u16);

impl ServerVersion {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().splitn(3, '.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts
            .next()
            .map(|p| {
                p.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        Some(Self(major, minor, patch))
    }

    /// LPOS landed in 6.0.6; older servers fall back to list scans.
    pub fn supports_lpos(&self) -> bool {
        *self >= ServerVersion(6, 0, 6)
    }
}

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

pub struct StoreClient {
    client: RedisClient,
    conn: ConnectionManager,
    version: ServerVersion,
    client_command_supported: bool,
}

impl StoreClient {
    pub async fn connect(url: &str, connection_name: &str) -> Result<Self> {
        let client = RedisClient::open(url)?;
        let mut conn = client.get_connection_manager().await?;

        let setname: redis::RedisResult<()> = redis::cmd("CLIENT")
            .arg("SETNAME")
            .arg(connection_name)
            .query_async(&mut conn)
            .await;
        let client_command_supported = match setname {
            Ok(()) => true,
            Err(err) => {
                // Some managed providers disable CLIENT entirely.
                let detail = err.to_string();
                if detail.contains("unknown command") {
                    warn!("server does not support the CLIENT command: {}", detail);
                    false
                } else {
                    return Err(err.into());
                }
            }
        };

        let version = Self::probe_version(&mut conn).await?;
        debug!(%version, "connected to store");

        Ok(Self {
            client,
            conn,
            version,
            client_command_supported,
        })
    }

    async fn probe_version(conn: &mut ConnectionManager) -> Result<ServerVersion> {
        let info: String = redis::cmd("INFO")
            .arg("server")
            .query_async(conn)
            .await?;
        info.lines()
            .find_map(|line| line.strip_prefix("redis_version:"))
            .and_then(ServerVersion::parse)
            .ok_or_else(|| {
                SwitchyardError::Script("server INFO did not report redis_version".into())
            })
    }

    pub fn version(&self) -> ServerVersion {
        self.version
    }

    pub fn client_command_supported(&self) -> bool {
        self.client_command_supported
    }

    /// A cheap clone of the shared connection. All scripted and pipelined
    /// operations run through these.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Dedicated connection for blocking pops; never share it with scripted
    /// traffic.
    pub async fn blocking_connection(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Blocking move from the tail of `source` to the head of `destination`.
    /// Returns `None` on timeout.
    pub async fn brpoplpush(
        conn: &mut MultiplexedConnection,
        source: &str,
        destination: &str,
        timeout_secs: f64,
    ) -> Result<Option<String>> {
        Ok(redis::cmd("BRPOPLPUSH")
            .arg(source)
            .arg(destination)
            .arg(timeout_secs)
            .query_async(conn)
            .await?)
    }

    /// Blocking pop from a list, used by the delay pump to sleep on the
    /// wake marker. Returns `None` on timeout.
    pub async fn brpop(
        conn: &mut MultiplexedConnection,
        key: &str,
        timeout_secs: f64,
    ) -> Result<Option<(String, String)>> {
        Ok(redis::cmd("BRPOP")
            .arg(key)
            .arg(timeout_secs)
            .query_async(conn)
            .await?)
    }

    /// Collects every key matching a pattern with a cursor sweep.
    pub async fn scan_keys(
        conn: &mut ConnectionManager,
        pattern: &str,
    ) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parsing_handles_real_info_values() {
        assert_eq!(ServerVersion::parse("7.2.4"), Some(ServerVersion(7, 2, 4)));
        assert_eq!(ServerVersion::parse("6.0"), Some(ServerVersion(6, 0, 0)));
        assert_eq!(
            ServerVersion::parse("5.0.7-something"),
            Some(ServerVersion(5, 0, 7))
        );
        assert_eq!(ServerVersion::parse("nonsense"), None);
    }

    #[test]
    fn lpos_gate_sits_at_6_0_6() {
        assert!(ServerVersion(6, 0, 6).supports_lpos());
        assert!(ServerVersion(7, 0, 0).supports_lpos());
        assert!(!ServerVersion(6, 0, 5).supports_lpos());
        assert!(!ServerVersion(5, 0, 14).supports_lpos());
    }
}
