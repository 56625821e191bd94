//! Redis store backend
//!
//! Multi-key transitions run as `MULTI/EXEC` pipelines or Lua scripts so that
//! no other client can observe a task in two membership structures at once.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{QueueCounts, QueueKeys, QueueStore, TerminalEntry};
use crate::errors::{StoreError, StoreResult};
use crate::models::{CompletedTask, FailedTask, Task, TaskState, TerminalKind, Trigger};

/// Pops the highest-scored member, then moves its id from pending to processing.
/// KEYS: priority, pending, processing
const CLAIM_SCRIPT: &str = r#"
local entries = redis.call('ZREVRANGE', KEYS[1], 0, 0)
if #entries == 0 then
  return false
end
local member = entries[1]
redis.call('ZREM', KEYS[1], member)
local ok, decoded = pcall(cjson.decode, member)
if ok and type(decoded) == 'table' and decoded['taskId'] then
  redis.call('SREM', KEYS[2], decoded['taskId'])
  redis.call('SADD', KEYS[3], decoded['taskId'])
end
return member
"#;

/// Leaves processing and writes a terminal record with a per-field expiry.
/// HEXPIRE needs Redis 7.4; older servers keep the record until the retention sweep.
/// KEYS: processing, terminal hash. ARGV: task id, record, ttl seconds
const TERMINAL_SCRIPT: &str = r#"
redis.call('SREM', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.pcall('HEXPIRE', KEYS[2], ARGV[3], 'FIELDS', 1, ARGV[1])
return 1
"#;

/// Overwrites a hash field only when it already exists.
/// KEYS: trigger hash. ARGV: trigger id, definition
const UPDATE_IF_PRESENT_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return 1
"#;

/// [`QueueStore`] backed by a Redis server
#[derive(Clone)]
pub struct RedisQueueStore {
    connection: ConnectionManager,
    trigger_key: String,
    claim_script: Script,
    terminal_script: Script,
    update_if_present_script: Script,
}

impl std::fmt::Debug for RedisQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueStore")
            .field("trigger_key", &self.trigger_key)
            .finish_non_exhaustive()
    }
}

impl RedisQueueStore {
    /// Connect to `redis_url`; the connection manager reconnects on its own after drops
    pub async fn connect(redis_url: &str, trigger_key: impl Into<String>) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| StoreError::ConnectionFailed {
            message: format!("invalid redis url '{redis_url}': {e}"),
        })?;
        let connection = ConnectionManager::new(client).await?;
        info!("Connected to redis at {}", redis_url);

        Ok(Self {
            connection,
            trigger_key: trigger_key.into(),
            claim_script: Script::new(CLAIM_SCRIPT),
            terminal_script: Script::new(TERMINAL_SCRIPT),
            update_if_present_script: Script::new(UPDATE_IF_PRESENT_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }

    async fn write_terminal(
        &self,
        keys: &QueueKeys,
        kind: TerminalKind,
        task_id: &str,
        payload: String,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut conn = self.conn();
        self.terminal_script
            .key(&keys.processing)
            .key(keys.terminal(kind))
            .arg(task_id)
            .arg(payload)
            .arg(ttl.as_secs().max(1))
            .invoke_async::<i64>(&mut conn)
            .await?;
        debug!("Wrote {} record for task {}", kind, task_id);
        Ok(())
    }
}

fn decode_task(key: &str, raw: &str) -> StoreResult<Task> {
    serde_json::from_str(raw).map_err(|e| StoreError::corrupt_record(key, e.to_string()))
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn push_task(&self, queue: &str, task: &Task, rank: u8) -> StoreResult<()> {
        let keys = QueueKeys::new(queue);
        let member = serde_json::to_string(task)?;
        let mut conn = self.conn();

        redis::pipe()
            .atomic()
            .zadd(&keys.priority, member, rank)
            .ignore()
            .sadd(&keys.pending, &task.task_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim_highest(&self, queue: &str) -> StoreResult<Option<Task>> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn();

        let member: Option<String> = self
            .claim_script
            .key(&keys.priority)
            .key(&keys.pending)
            .key(&keys.processing)
            .invoke_async(&mut conn)
            .await?;

        member
            .map(|raw| decode_task(&keys.priority, &raw))
            .transpose()
    }

    async fn remove_task(&self, queue: &str, task_id: &str) -> StoreResult<bool> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn();

        let members: Vec<String> = conn.zrange(&keys.priority, 0, -1).await?;
        let matching = members.into_iter().find(|raw| {
            serde_json::from_str::<Task>(raw)
                .map(|task| task.task_id == task_id)
                .unwrap_or(false)
        });

        let Some(member) = matching else {
            // A stale pending id is still cleared
            let unmarked: usize = conn.srem(&keys.pending, task_id).await?;
            return Ok(unmarked > 0);
        };

        let (removed,): (usize,) = redis::pipe()
            .atomic()
            .zrem(&keys.priority, member)
            .srem(&keys.pending, task_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn list_queued(&self, queue: &str) -> StoreResult<Vec<Task>> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn();

        let members: Vec<String> = conn.zrevrange(&keys.priority, 0, -1).await?;
        let tasks = members
            .iter()
            .filter_map(|raw| match decode_task(&keys.priority, raw) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!("Skipping undecodable queue member: {}", e);
                    None
                }
            })
            .collect();
        Ok(tasks)
    }

    async fn requeue_task(&self, queue: &str, task: &Task, rank: u8) -> StoreResult<()> {
        let keys = QueueKeys::new(queue);
        let member = serde_json::to_string(task)?;
        let mut conn = self.conn();

        redis::pipe()
            .atomic()
            .srem(&keys.processing, &task.task_id)
            .ignore()
            .zadd(&keys.priority, member, rank)
            .ignore()
            .sadd(&keys.pending, &task.task_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn record_completed(
        &self,
        queue: &str,
        record: &CompletedTask,
        ttl: Duration,
    ) -> StoreResult<()> {
        let payload = serde_json::to_string(record)?;
        self.write_terminal(
            &QueueKeys::new(queue),
            TerminalKind::Completed,
            &record.task.task_id,
            payload,
            ttl,
        )
        .await
    }

    async fn record_failed(
        &self,
        queue: &str,
        record: &FailedTask,
        ttl: Duration,
    ) -> StoreResult<()> {
        let payload = serde_json::to_string(record)?;
        self.write_terminal(
            &QueueKeys::new(queue),
            TerminalKind::Failed,
            &record.task.task_id,
            payload,
            ttl,
        )
        .await
    }

    async fn terminal_entries(
        &self,
        queue: &str,
        kind: TerminalKind,
    ) -> StoreResult<Vec<TerminalEntry>> {
        let keys = QueueKeys::new(queue);
        let key = keys.terminal(kind);
        let mut conn = self.conn();

        let records: HashMap<String, String> = conn.hgetall(key).await?;
        let mut entries = Vec::with_capacity(records.len());
        for (task_id, raw) in records {
            let decoded = match kind {
                TerminalKind::Completed => serde_json::from_str::<CompletedTask>(&raw)
                    .map(|record| TerminalEntry::from(&record)),
                TerminalKind::Failed => serde_json::from_str::<FailedTask>(&raw)
                    .map(|record| TerminalEntry::from(&record)),
            };
            match decoded {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping undecodable {} record {}: {}", kind, task_id, e),
            }
        }
        Ok(entries)
    }

    async fn terminal_record(
        &self,
        queue: &str,
        kind: TerminalKind,
        task_id: &str,
    ) -> StoreResult<Option<serde_json::Value>> {
        let keys = QueueKeys::new(queue);
        let key = keys.terminal(kind);
        let mut conn = self.conn();

        let raw: Option<String> = conn.hget(key, task_id).await?;
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|e| StoreError::corrupt_record(key, e.to_string()))
        })
        .transpose()
    }

    async fn purge_terminal(
        &self,
        queue: &str,
        kind: TerminalKind,
        task_ids: &[String],
    ) -> StoreResult<usize> {
        if task_ids.is_empty() {
            return Ok(0);
        }
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn();
        let removed: usize = conn.hdel(keys.terminal(kind), task_ids).await?;
        Ok(removed)
    }

    async fn task_state(&self, queue: &str, task_id: &str) -> StoreResult<Option<TaskState>> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn();

        let (processing, pending, completed, failed): (bool, bool, bool, bool) = redis::pipe()
            .sismember(&keys.processing, task_id)
            .sismember(&keys.pending, task_id)
            .hexists(&keys.completed, task_id)
            .hexists(&keys.failed, task_id)
            .query_async(&mut conn)
            .await?;

        let state = if processing {
            Some(TaskState::Processing)
        } else if pending {
            Some(TaskState::Pending)
        } else if completed {
            Some(TaskState::Completed)
        } else if failed {
            Some(TaskState::Failed)
        } else {
            None
        };
        Ok(state)
    }

    async fn queue_counts(&self, queue: &str) -> StoreResult<QueueCounts> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn();

        let (priority, pending, processing, completed, failed) = redis::pipe()
            .zcard(&keys.priority)
            .scard(&keys.pending)
            .scard(&keys.processing)
            .hlen(&keys.completed)
            .hlen(&keys.failed)
            .query_async(&mut conn)
            .await?;

        Ok(QueueCounts {
            priority,
            pending,
            processing,
            completed,
            failed,
        })
    }

    async fn clear_queue(&self, queue: &str) -> StoreResult<usize> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn();

        let (priority, pending, processing): (usize, usize, usize) = redis::pipe()
            .atomic()
            .zcard(&keys.priority)
            .scard(&keys.pending)
            .scard(&keys.processing)
            .del(&[&keys.priority, &keys.pending, &keys.processing])
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(priority + pending + processing)
    }

    async fn save_trigger(&self, trigger: &Trigger) -> StoreResult<()> {
        let payload = serde_json::to_string(trigger)?;
        let mut conn = self.conn();
        conn.hset::<_, _, _, ()>(&self.trigger_key, &trigger.task_id, payload)
            .await?;
        Ok(())
    }

    async fn update_trigger(&self, trigger: &Trigger) -> StoreResult<bool> {
        let payload = serde_json::to_string(trigger)?;
        let mut conn = self.conn();

        let updated: i64 = self
            .update_if_present_script
            .key(&self.trigger_key)
            .arg(&trigger.task_id)
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn load_triggers(&self) -> StoreResult<Vec<Trigger>> {
        let mut conn = self.conn();
        let records: HashMap<String, String> = conn.hgetall(&self.trigger_key).await?;

        let mut triggers = Vec::with_capacity(records.len());
        for (trigger_id, raw) in records {
            match serde_json::from_str::<Trigger>(&raw) {
                Ok(trigger) => triggers.push(trigger),
                Err(e) => warn!("Skipping undecodable trigger {}: {}", trigger_id, e),
            }
        }
        triggers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(triggers)
    }

    async fn delete_trigger(&self, trigger_id: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: usize = conn.hdel(&self.trigger_key, trigger_id).await?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply != "PONG" {
            return Err(StoreError::command_failed("PING", format!("unexpected reply {reply}")));
        }
        Ok(())
    }
}
