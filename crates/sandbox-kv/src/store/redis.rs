use std::time::Duration;

use async_trait::async_trait;
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::resp::{MAX_DEPTH, Resp, read_value, write_argv};
use super::{RedisConfig, Store};
use crate::error::{Result, StoreError};

/// Compare-and-delete, atomic on the server.
const DELETE_IF_EQUALS: &str =
    "if redis.call('GET', KEYS[1]) == ARGV[1] then return redis.call('DEL', KEYS[1]) else return 0 end";

/// Redis over a single connection.
///
/// Commands are serialized on the connection; a transport failure drops it
/// and the next command reconnects.
pub struct RedisStore {
    config: RedisConfig,
    conn: Mutex<Option<BufStream<TcpStream>>>,
}

impl RedisStore {
    /// Connect eagerly so a bad address fails at setup.
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        let stream = open(&config).await?;
        Ok(Self {
            config,
            conn: Mutex::new(Some(stream)),
        })
    }

    fn key(&self, key: &str) -> Vec<u8> {
        format!("{}{key}", self.config.key_prefix).into_bytes()
    }

    async fn call(&self, argv: &[&[u8]]) -> Result<Resp> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(open(&self.config).await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::NotConnected);
        };
        let result = async {
            write_argv(conn, argv).await?;
            read_value(conn, MAX_DEPTH).await
        }
        .await;
        if let Err(e @ (StoreError::Io(_) | StoreError::Protocol(_))) = &result {
            warn!(error = %e, "dropping redis connection");
            *guard = None;
        }
        result?.into_result()
    }
}

async fn open(config: &RedisConfig) -> Result<BufStream<TcpStream>> {
    debug!(host = %config.host, port = config.port, db = config.db, "connecting to redis");
    let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
    let mut conn = BufStream::new(stream);
    if config.db != 0 {
        let db = config.db.to_string();
        write_argv(&mut conn, &[b"SELECT", db.as_bytes()]).await?;
        read_value(&mut conn, MAX_DEPTH).await?.into_result()?;
    }
    Ok(conn)
}

fn millis(ttl: Duration) -> String {
    ttl.as_millis().max(1).to_string()
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.call(&[b"GET", &self.key(key)]).await?.into_string()
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let key = self.key(key);
        match ttl {
            Some(ttl) => {
                let ms = millis(ttl);
                self.call(&[b"SET", &key, value.as_bytes(), b"PX", ms.as_bytes()])
                    .await?
            }
            None => self.call(&[b"SET", &key, value.as_bytes()]).await?,
        };
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let ms = millis(ttl);
        let reply = self
            .call(&[b"SET", &self.key(key), value.as_bytes(), b"NX", b"PX", ms.as_bytes()])
            .await?;
        Ok(reply.into_string()?.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.call(&[b"DEL", &self.key(key)]).await?.into_integer()? > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.call(&[b"EXISTS", &self.key(key)]).await?.into_integer()? > 0)
    }

    async fn incr_by(&self, key: &str, amount: i64) -> Result<i64> {
        let amount = amount.to_string();
        self.call(&[b"INCRBY", &self.key(key), amount.as_bytes()])
            .await?
            .into_integer()
    }

    async fn scan(&self, cursor: &str, pattern: &str, count: usize) -> Result<(String, Vec<String>)> {
        let count = count.to_string();
        let reply = self
            .call(&[
                b"SCAN",
                cursor.as_bytes(),
                b"MATCH",
                &self.key(pattern),
                b"COUNT",
                count.as_bytes(),
            ])
            .await?;
        let mut parts = reply.into_array()?.into_iter();
        let (Some(next), Some(keys), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(StoreError::Protocol("SCAN reply must have two parts".into()));
        };
        let next = next
            .into_string()?
            .ok_or_else(|| StoreError::Protocol("SCAN returned a nil cursor".into()))?;
        let mut out = Vec::new();
        for key in keys.into_array()? {
            let Some(key) = key.into_string()? else {
                continue;
            };
            if let Some(key) = key.strip_prefix(&self.config.key_prefix) {
                out.push(key.to_string());
            }
        }
        Ok((next, out))
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let reply = self
            .call(&[
                b"EVAL",
                DELETE_IF_EQUALS.as_bytes(),
                b"1",
                &self.key(key),
                value.as_bytes(),
            ])
            .await?;
        Ok(reply.into_integer()? > 0)
    }
}
