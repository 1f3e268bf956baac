//! Redis Streams transport.
//!
//! One shared connection serves publishes, acks and pending queries. Every
//! consumer gets its own connection for `XREADGROUP ... BLOCK`, because a
//! blocking read parks the whole multiplexed pipeline it runs on.
//!
//! Single-node deployments go through [`ConnectionManager`], clusters
//! through [`ClusterConnection`]; both reconnect on their own after the
//! initial connect succeeds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::streams::{StreamPendingCountReply, StreamPendingReply};
use redis::{Cmd, ErrorKind, FromRedisValue, RedisError, RedisResult, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{StreamEntry, StreamTransport, TransportEvent, ReconnectPolicy, EVENT_CHANNEL_CAPACITY};
use crate::config::BrokerTarget;
use crate::errors::TransportError;
use crate::streams::TrimStrategy;

/// Slack added on top of the block time before a read is considered hung.
const READ_TIMEOUT_SLACK: Duration = Duration::from_secs(10);

#[derive(Clone)]
enum Connection {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

impl Connection {
    async fn query<T: FromRedisValue>(&mut self, cmd: &Cmd) -> RedisResult<T> {
        match self {
            Connection::Single(conn) => cmd.query_async(conn).await,
            Connection::Cluster(conn) => cmd.query_async(conn).await,
        }
    }
}

/// Transport backed by a Redis node or cluster.
pub struct RedisTransport {
    target: BrokerTarget,
    policy: ReconnectPolicy,
    connection: RwLock<Option<Connection>>,
    readers: Mutex<HashMap<String, Connection>>,
    connected: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl RedisTransport {
    #[must_use]
    pub fn new(target: BrokerTarget, policy: ReconnectPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            target,
            policy,
            connection: RwLock::new(None),
            readers: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            events,
        }
    }

    async fn open(&self, response_timeout: Option<Duration>) -> RedisResult<Connection> {
        match &self.target {
            BrokerTarget::Single(url) => {
                let client = redis::Client::open(url.as_str())?;
                let manager = match response_timeout {
                    Some(timeout) => {
                        let config = ConnectionManagerConfig::new().set_response_timeout(timeout);
                        client.get_connection_manager_with_config(config).await?
                    }
                    None => client.get_connection_manager().await?,
                };
                Ok(Connection::Single(manager))
            }
            BrokerTarget::Cluster(nodes) => {
                let mut builder = ClusterClient::builder(nodes.clone());
                if let Some(timeout) = response_timeout {
                    builder = builder.response_timeout(timeout);
                }
                let conn = builder.build()?.get_async_connection().await?;
                Ok(Connection::Cluster(conn))
            }
        }
    }

    fn shared(&self) -> Result<Connection, TransportError> {
        self.connection
            .read()
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    async fn reader(&self, key: &str, block: Duration) -> Result<Connection, TransportError> {
        if let Some(conn) = self.readers.lock().get(key).cloned() {
            return Ok(conn);
        }
        if self.connection.read().is_none() {
            return Err(TransportError::NotConnected);
        }
        let conn = self
            .open(Some(block + READ_TIMEOUT_SLACK))
            .await
            .map_err(|e| self.failed(&e, "", ""))?;
        debug!(reader = key, "Opened blocking-read connection");
        self.readers.lock().insert(key.to_string(), conn.clone());
        Ok(conn)
    }

    async fn run<T: FromRedisValue>(
        &self,
        cmd: &Cmd,
        stream: &str,
        group: &str,
    ) -> Result<T, TransportError> {
        let mut conn = self.shared()?;
        match conn.query(cmd).await {
            Ok(value) => {
                self.mark_ready();
                Ok(value)
            }
            Err(e) => Err(self.failed(&e, stream, group)),
        }
    }

    fn mark_ready(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) && self.connection.read().is_some() {
            info!("Broker connection restored");
            let _ = self.events.send(TransportEvent::Ready);
        }
    }

    /// Classify a failure and, for connection-class ones, flag the transport
    /// as disconnected and notify subscribers.
    fn failed(&self, err: &RedisError, stream: &str, group: &str) -> TransportError {
        let error = classify(err, stream, group);
        if error.is_connection() {
            self.connected.store(false, Ordering::SeqCst);
            let _ = self.events.send(TransportEvent::Error(err.to_string()));
        }
        error
    }
}

#[async_trait]
impl StreamTransport for RedisTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut attempt = 0u32;
        loop {
            match self.open(None).await {
                Ok(conn) => {
                    *self.connection.write() = Some(conn);
                    self.connected.store(true, Ordering::SeqCst);
                    info!(attempts = attempt + 1, "Connected to broker");
                    let _ = self.events.send(TransportEvent::Ready);
                    return Ok(());
                }
                Err(e) => {
                    let error = classify(&e, "", "");
                    let _ = self.events.send(TransportEvent::Error(e.to_string()));
                    attempt += 1;
                    if !error.is_connection() || attempt >= self.policy.max_attempts {
                        warn!(attempts = attempt, error = %e, "Giving up connecting to broker");
                        return Err(error);
                    }
                    let delay = self.policy.delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker connection failed, retrying"
                    );
                    let _ = self
                        .events
                        .send(TransportEvent::Reconnecting { attempt, delay });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn append(
        &self,
        stream: &str,
        trim: Option<&TrimStrategy>,
        fields: &[(&str, &str)],
    ) -> Result<String, TransportError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(strategy) = trim {
            cmd.arg(strategy.args());
        }
        cmd.arg("*");
        for (field, value) in fields {
            cmd.arg(*field).arg(*value);
        }
        self.run(&cmd, stream, "").await
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), TransportError> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg(start_id).arg("MKSTREAM");
        let _: Value = self.run(&cmd, stream, group).await?;
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        let key = format!("{stream}:{group}:{consumer}");
        let mut conn = self.reader(&key, block).await?;

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count.max(1));
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(stream).arg(">");

        let reply: Value = match conn.query(&cmd).await {
            Ok(reply) => reply,
            Err(e) => {
                let error = self.failed(&e, stream, group);
                if error.is_connection() {
                    self.readers.lock().remove(&key);
                }
                return Err(error);
            }
        };
        self.mark_ready();
        parse_read_reply(&reply).map_err(|e| classify(&e, stream, group))
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[&str]) -> Result<u64, TransportError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group).arg(ids);
        self.run(&cmd, stream, group).await
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        let min_idle_ms = min_idle.as_millis() as u64;

        let pending_cmd = idle_pending_cmd(stream, group, min_idle_ms, count);
        let pending: StreamPendingCountReply = self.run(&pending_cmd, stream, group).await?;

        let idle: Vec<&str> = pending.ids.iter().map(|p| p.id.as_str()).collect();
        if idle.is_empty() {
            return Ok(Vec::new());
        }

        let mut claim_cmd = redis::cmd("XCLAIM");
        claim_cmd.arg(stream).arg(group).arg(consumer).arg(min_idle_ms).arg(&idle);
        let reply: Value = self.run(&claim_cmd, stream, group).await?;
        match reply {
            Value::Array(items) => parse_entries(&items).map_err(|e| classify(&e, stream, group)),
            Value::Nil => Ok(Vec::new()),
            other => Err(TransportError::Command(format!(
                "Unexpected XCLAIM reply: {other:?}"
            ))),
        }
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, TransportError> {
        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(stream).arg(group);
        let reply: StreamPendingReply = self.run(&cmd, stream, group).await?;
        Ok(reply.count() as u64)
    }

    async fn length(&self, stream: &str) -> Result<u64, TransportError> {
        let mut cmd = redis::cmd("XLEN");
        cmd.arg(stream);
        self.run(&cmd, stream, "").await
    }

    async fn quit(&self) -> Result<(), TransportError> {
        let had_connection = self.connection.write().take().is_some();
        self.readers.lock().clear();
        self.connected.store(false, Ordering::SeqCst);
        if had_connection {
            info!("Broker connection closed");
            let _ = self.events.send(TransportEvent::Closed);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Map a Redis error onto the transport taxonomy.
fn classify(err: &RedisError, stream: &str, group: &str) -> TransportError {
    if let Some(error) = group_error(err.code(), stream, group) {
        return error;
    }

    let connection_class = err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
        || matches!(
            err.kind(),
            ErrorKind::ClusterDown | ErrorKind::MasterDown | ErrorKind::TryAgain | ErrorKind::BusyLoadingError
        );

    if connection_class {
        TransportError::Connection(err.to_string())
    } else {
        TransportError::Command(err.to_string())
    }
}

fn group_error(code: Option<&str>, stream: &str, group: &str) -> Option<TransportError> {
    match code? {
        "BUSYGROUP" => Some(TransportError::GroupExists),
        "NOGROUP" => Some(TransportError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        }),
        _ => None,
    }
}

/// `XPENDING` filtered by idle time on the server, so a backlog of
/// entries still being worked on cannot hide idle ones behind it.
fn idle_pending_cmd(stream: &str, group: &str, min_idle_ms: u64, count: usize) -> Cmd {
    let mut cmd = redis::cmd("XPENDING");
    cmd.arg(stream)
        .arg(group)
        .arg("IDLE")
        .arg(min_idle_ms)
        .arg("-")
        .arg("+")
        .arg(count.max(1));
    cmd
}

/// Entries of an `XCLAIM` or per-stream `XREADGROUP` reply. Entries deleted
/// since delivery come back as nil and are skipped.
fn parse_entries(items: &[Value]) -> RedisResult<Vec<StreamEntry>> {
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        if matches!(item, Value::Nil) {
            continue;
        }
        let (id, fields): (String, Option<Vec<(String, String)>>) = redis::from_redis_value(item)?;
        entries.push(StreamEntry::new(id, fields.unwrap_or_default()));
    }
    Ok(entries)
}

/// Flatten an `XREADGROUP` reply; nil means the block timed out.
fn parse_read_reply(reply: &Value) -> RedisResult<Vec<StreamEntry>> {
    let per_stream: Vec<&Value> = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Array(streams) => streams
            .iter()
            .filter_map(|s| match s {
                Value::Array(parts) => parts.get(1),
                _ => None,
            })
            .collect(),
        Value::Map(streams) => streams.iter().map(|(_, entries)| entries).collect(),
        _ => {
            return Err(RedisError::from((
                ErrorKind::TypeError,
                "Unexpected XREADGROUP reply",
            )))
        }
    };

    let mut entries = Vec::new();
    for value in per_stream {
        if let Value::Array(items) = value {
            entries.extend(parse_entries(items)?);
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    fn entry(id: &str, fields: &[(&str, &str)]) -> Value {
        let flat = fields
            .iter()
            .flat_map(|(k, v)| [bulk(k), bulk(v)])
            .collect();
        Value::Array(vec![bulk(id), Value::Array(flat)])
    }

    #[test]
    fn test_group_error_codes() {
        assert_eq!(
            group_error(Some("BUSYGROUP"), "s", "g"),
            Some(TransportError::GroupExists)
        );
        assert_eq!(
            group_error(Some("NOGROUP"), "s", "g"),
            Some(TransportError::NoGroup {
                stream: "s".into(),
                group: "g".into()
            })
        );
        assert_eq!(group_error(Some("ERR"), "s", "g"), None);
        assert_eq!(group_error(None, "s", "g"), None);
    }

    #[test]
    fn test_classify_connection_errors() {
        let refused = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(classify(&refused, "", "").is_connection());

        let wrong_type = RedisError::from((ErrorKind::TypeError, "WRONGTYPE"));
        assert!(!classify(&wrong_type, "", "").is_connection());
    }

    #[test]
    fn test_parse_read_reply() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("order.request"),
            Value::Array(vec![
                entry("1-0", &[("data", "{\"a\":1}")]),
                entry("1-1", &[("data", "{}")]),
            ]),
        ])]);
        let entries = parse_read_reply(&reply).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "1-0");
        assert_eq!(entries[0].field("data"), Some("{\"a\":1}"));
    }

    #[test]
    fn test_parse_read_reply_timeout() {
        assert!(parse_read_reply(&Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn test_parse_claim_skips_deleted_entries() {
        let items = vec![entry("5-0", &[("data", "x")]), Value::Nil];
        let entries = parse_entries(&items).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "5-0");
    }

    #[test]
    fn test_claim_scan_filters_by_idle_time() {
        let cmd = idle_pending_cmd("fills", "risk", 30_000, 0);
        let args: Vec<String> = cmd
            .args_iter()
            .filter_map(|arg| match arg {
                redis::Arg::Simple(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
                redis::Arg::Cursor => None,
            })
            .collect();
        // The idle filter precedes the range; a zero count still asks for one.
        assert_eq!(
            args,
            ["XPENDING", "fills", "risk", "IDLE", "30000", "-", "+", "1"]
        );
    }

    #[tokio::test]
    async fn test_commands_require_connect() {
        let transport = RedisTransport::new(
            BrokerTarget::Single("redis://127.0.0.1:6379".into()),
            ReconnectPolicy::default(),
        );
        assert!(!transport.is_connected());
        assert_eq!(
            transport.length("s").await.unwrap_err(),
            TransportError::NotConnected
        );
    }
}
