//! Redis Streams broker.
//!
//! - Append: `XADD <stream> * field value ...`
//! - Groups: `XGROUP CREATE <stream> <group> 0 MKSTREAM` (`BUSYGROUP` means it exists)
//! - Claim: `XREADGROUP GROUP <group> <consumer> COUNT n BLOCK ms STREAMS <stream> >|0`
//! - Ack: `XACK`
//! - History: `XREVRANGE <stream> (<id>|+ - COUNT n`
//!
//! Shared operations go through one `ConnectionManager`; every reader opens its
//! own so a blocking `XREADGROUP` never holds up publishers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, Value};
use tracing::{debug, instrument};

use agilebus_events::RecordFields;

use super::{
    BrokerConnector, BrokerError, GroupReader, GroupSetup, ReadFrom, StreamBroker, StreamEntry,
    StreamStats,
};

fn broker_error(context: &str, e: RedisError) -> BrokerError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
    {
        BrokerError::Connection(format!("{context}: {e}"))
    } else {
        BrokerError::Command(format!("{context}: {e}"))
    }
}

/// Dials Redis from a URL such as `redis://localhost:6379/0`.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: redis::Client,
}

impl RedisConnector {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Command(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BrokerConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn StreamBroker>, BrokerError> {
        let conn = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| broker_error("connect", e))?;

        Ok(Arc::new(RedisStreamBroker {
            client: self.client.clone(),
            conn,
        }))
    }
}

#[derive(Clone)]
pub struct RedisStreamBroker {
    client: redis::Client,
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStreamBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamBroker")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StreamBroker for RedisStreamBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| broker_error("PING failed", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupSetup, BrokerError> {
        let mut conn = self.conn.clone();
        let created: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => Ok(GroupSetup::Created),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(GroupSetup::AlreadyExists),
            Err(e) => Err(broker_error("XGROUP CREATE failed", e)),
        }
    }

    async fn append(&self, stream: &str, fields: &RecordFields) -> Result<String, BrokerError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (key, value) in fields {
            cmd.arg(key).arg(value);
        }

        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| broker_error("XADD failed", e))
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, BrokerError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(ids)
            .query_async(&mut conn)
            .await
            .map_err(|e| broker_error("XACK failed", e))
    }

    async fn rev_range(
        &self,
        stream: &str,
        before: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let end = before.map_or_else(|| "+".to_string(), |id| format!("({id}"));

        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XREVRANGE")
            .arg(stream)
            .arg(end)
            .arg("-")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| broker_error("XREVRANGE failed", e))?;

        parse_entries(reply)
    }

    async fn stream_stats(&self, stream: &str) -> Result<StreamStats, BrokerError> {
        let mut conn = self.conn.clone();
        let groups: Vec<HashMap<String, Value>> = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| broker_error("XINFO GROUPS failed", e))?;
        let length: u64 = redis::cmd("XLEN")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| broker_error("XLEN failed", e))?;

        let consumers = groups
            .iter()
            .filter_map(|g| g.get("consumers"))
            .filter_map(|v| redis::from_redis_value::<u64>(v).ok())
            .sum();

        Ok(StreamStats {
            stream_name: stream.to_string(),
            length,
            groups: groups.len() as u64,
            consumers,
        })
    }

    async fn reader(&self) -> Result<Box<dyn GroupReader>, BrokerError> {
        let conn = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| broker_error("reader connect", e))?;
        Ok(Box::new(RedisGroupReader { conn }))
    }

    async fn close(&self) {
        // Connections are released when the last clone of the manager drops.
        debug!("redis broker handle closed");
    }
}

struct RedisGroupReader {
    conn: ConnectionManager,
}

#[async_trait]
impl GroupReader for RedisGroupReader {
    async fn read(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);
        // Pending reads never block: the reply is whatever this consumer still owns.
        if from == ReadFrom::New {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(stream).arg(match from {
            ReadFrom::New => ">",
            ReadFrom::Pending => "0",
        });

        let reply: Value = cmd
            .query_async(&mut self.conn)
            .await
            .map_err(|e| broker_error("XREADGROUP failed", e))?;

        // Reply: nil on timeout, otherwise [[stream, [entry...]], ...]
        let Value::Bulk(streams) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for item in streams {
            let Value::Bulk(mut pair) = item else {
                continue;
            };
            if pair.len() == 2 {
                entries.extend(parse_entries(pair.remove(1))?);
            }
        }
        Ok(entries)
    }
}

/// Parse `[[id, [field, value, ...]], ...]`.
///
/// Pending entries whose record was trimmed come back with nil fields; they are
/// returned with an empty field map so the consumer can still settle them.
fn parse_entries(reply: Value) -> Result<Vec<StreamEntry>, BrokerError> {
    let Value::Bulk(items) = reply else {
        return Ok(Vec::new());
    };
    items.into_iter().map(parse_entry).collect()
}

fn parse_entry(entry: Value) -> Result<StreamEntry, BrokerError> {
    let malformed = |what: &str| BrokerError::Command(format!("malformed stream entry: {what}"));

    let Value::Bulk(parts) = entry else {
        return Err(malformed("not an array"));
    };
    let mut parts = parts.into_iter();

    let id = match parts.next() {
        Some(Value::Data(raw)) => String::from_utf8_lossy(&raw).into_owned(),
        Some(Value::Status(s)) => s,
        _ => return Err(malformed("missing id")),
    };

    let mut fields = RecordFields::new();
    if let Some(Value::Bulk(flat)) = parts.next() {
        for pair in flat.chunks(2) {
            if let [Value::Data(key), Value::Data(value)] = pair {
                fields.insert(
                    String::from_utf8_lossy(key).into_owned(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }

    Ok(StreamEntry { id, fields })
}
