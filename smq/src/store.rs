use std::{fmt::Display, sync::Arc};

use redis::{
    Client,
    aio::{ConnectionManager, MultiplexedConnection, PubSub},
};

use crate::{error::SmqError, scripts::Scripts};

/// Minimum server version that ships LMOVE and BLMOVE.
const LMOVE_MIN_VERSION: ServerVersion = ServerVersion {
    major: 6,
    minor: 2,
    patch: 0,
};

const SCAN_COUNT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    /// Extract `redis_version` from the output of `INFO server`.
    pub fn from_info(info: &str) -> Option<Self> {
        let version = info
            .lines()
            .find_map(|line| line.trim().strip_prefix("redis_version:"))?;
        let mut parts = version.trim().split('.').map(|p| p.parse::<u32>().ok());
        Some(Self {
            major: parts.next().flatten()?,
            minor: parts.next().flatten().unwrap_or(0),
            patch: parts.next().flatten().unwrap_or(0),
        })
    }

    pub fn supports_lmove(&self) -> bool {
        *self >= LMOVE_MIN_VERSION
    }
}

impl Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Allowed LMOVE directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListDirection {
    RightToLeft,
    LeftToRight,
}

impl ListDirection {
    fn args(&self) -> (&'static str, &'static str) {
        match self {
            ListDirection::RightToLeft => ("RIGHT", "LEFT"),
            ListDirection::LeftToRight => ("LEFT", "RIGHT"),
        }
    }

    fn script_arg(&self) -> &'static str {
        match self {
            ListDirection::RightToLeft => "RIGHT_LEFT",
            ListDirection::LeftToRight => "LEFT_RIGHT",
        }
    }
}

/// Connection context handed to every component.
///
/// Holds the client (for dedicated blocking and pub/sub connections), the shared
/// connection manager, the script registry and the detected server version.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    redis: ConnectionManager,
    scripts: Arc<Scripts>,
    version: ServerVersion,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, SmqError> {
        let client = Client::open(redis_url)?;
        Self::from_client(client).await
    }

    pub async fn from_client(client: Client) -> Result<Self, SmqError> {
        let redis = client.get_connection_manager().await?;

        let info: String = redis::cmd("INFO")
            .arg("server")
            .query_async(&mut redis.clone())
            .await?;
        let version = ServerVersion::from_info(&info).ok_or_else(|| {
            SmqError::UnexpectedScriptReply("INFO server did not report redis_version".into())
        })?;

        tracing::debug!(version = %version, "Connected to redis");

        Ok(Self {
            client,
            redis,
            scripts: Arc::new(Scripts::new()),
            version,
        })
    }

    pub fn conn(&self) -> ConnectionManager {
        self.redis.clone()
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn scripts(&self) -> &Scripts {
        &self.scripts
    }

    pub fn version(&self) -> ServerVersion {
        self.version
    }

    /// A connection of its own, for commands that block the server side of the socket.
    pub async fn dedicated_connection(&self) -> Result<MultiplexedConnection, SmqError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    pub async fn pubsub(&self) -> Result<PubSub, SmqError> {
        Ok(self.client.get_async_pubsub().await?)
    }

    /// LMOVE, or the equivalent script on servers that predate it.
    pub async fn lmove(
        &self,
        source: &str,
        destination: &str,
        direction: ListDirection,
    ) -> Result<Option<String>, SmqError> {
        let mut conn = self.conn();
        if self.version.supports_lmove() {
            let (from, to) = direction.args();
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(source)
                .arg(destination)
                .arg(from)
                .arg(to)
                .query_async(&mut conn)
                .await?;
            return Ok(moved);
        }

        let moved: Option<String> = self
            .scripts
            .list_move
            .key(source)
            .key(destination)
            .arg(direction.script_arg())
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    /// Blocking RIGHT→LEFT move on the given connection. A zero timeout blocks indefinitely.
    pub async fn blocking_move(
        &self,
        conn: &mut MultiplexedConnection,
        source: &str,
        destination: &str,
        timeout_secs: f64,
    ) -> Result<Option<String>, SmqError> {
        let mut cmd = if self.version.supports_lmove() {
            let (from, to) = ListDirection::RightToLeft.args();
            let mut cmd = redis::cmd("BLMOVE");
            cmd.arg(source).arg(destination).arg(from).arg(to);
            cmd
        } else {
            let mut cmd = redis::cmd("BRPOPLPUSH");
            cmd.arg(source).arg(destination);
            cmd
        };
        cmd.arg(timeout_secs);
        let moved: Option<String> = cmd.query_async(conn).await?;
        Ok(moved)
    }

    /// Full SSCAN of a set.
    pub async fn sscan_all(&self, key: &str) -> Result<Vec<String>, SmqError> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut members = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SSCAN")
                .arg(key)
                .arg(cursor)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            members.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(members)
    }

    /// Full HSCAN of a hash.
    pub async fn hscan_all(&self, key: &str) -> Result<Vec<(String, String)>, SmqError> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut entries = Vec::new();
        loop {
            let (next, batch): (u64, Vec<(String, String)>) = redis::cmd("HSCAN")
                .arg(key)
                .arg(cursor)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            entries.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(entries)
    }
}
