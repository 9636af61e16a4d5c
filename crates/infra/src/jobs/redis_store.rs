//! Redis-backed schedule store.
//!
//! Layout (prefix defaults to `sched:`):
//! - **Time index**: sorted set `{prefix}payable_reminders`, member = job id,
//!   score = due instant in epoch seconds
//! - **Payloads**: `{prefix}job:{job_id}` → JSON, with `EX` TTL
//! - **Job sets**: `{prefix}jobs_by_entity:{payable_id}` → set of job ids
//!
//! Pop-due runs as a Lua script so two workers can never claim the same entry.

use std::sync::Arc;

use tracing::instrument;

use payremind_core::PayableId;

use super::config::ReminderConfig;
use super::store::{IndexEntry, ScheduleStore, StoreError};
use super::types::JobId;

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "sched:";

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

const POP_DUE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'WITHSCORES', 'LIMIT', 0, ARGV[2])
for i = 1, #due, 2 do
  redis.call('ZREM', KEYS[1], due[i])
end
return due
";

/// Key naming for one scheduler namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn index(&self) -> String {
        format!("{}payable_reminders", self.prefix)
    }

    pub fn payload(&self, job_id: &JobId) -> String {
        format!("{}job:{}", self.prefix, job_id)
    }

    pub fn entity_set(&self, payable_id: PayableId) -> String {
        format!("{}jobs_by_entity:{}", self.prefix, payable_id)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

#[derive(Debug, Clone)]
pub struct RedisScheduleStore {
    client: Arc<redis::Client>,
    keys: KeySpace,
    pop_due: Arc<redis::Script>,
}

impl RedisScheduleStore {
    /// Create a store.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `keys` - key namespace
    pub fn new(redis_url: impl AsRef<str>, keys: KeySpace) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            keys,
            pop_due: Arc::new(redis::Script::new(POP_DUE_SCRIPT)),
        })
    }

    /// Connect to `REDIS_URL` (default `redis://127.0.0.1:6379`) using the
    /// config's key prefix.
    pub fn from_env(config: &ReminderConfig) -> Result<Self, StoreError> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
        Self::new(url, KeySpace::new(config.key_prefix.clone()))
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Round-trip to the server.
    pub fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let _: String = redis::cmd("PING")
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("PING failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<redis::Connection, StoreError> {
        self.client
            .get_connection()
            .map_err(|e| StoreError::Connection(e.to_string()))
    }
}

fn entries(rows: Vec<(String, f64)>) -> Vec<IndexEntry> {
    rows.into_iter()
        .map(|(member, score)| IndexEntry {
            due_at: score as i64,
            job_id: JobId::from_raw(member),
        })
        .collect()
}

/// `LIMIT` count; counts past `i64::MAX` mean "no limit", which Redis spells
/// as a negative count.
fn limit_arg(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(-1)
}

fn bound(value: Option<i64>, open: &str) -> String {
    value.map_or_else(|| open.to_string(), |v| v.to_string())
}

impl ScheduleStore for RedisScheduleStore {
    fn index_insert(
        &self,
        job_id: &JobId,
        due_at: i64,
        only_if_absent: bool,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(self.keys.index());
        if only_if_absent {
            cmd.arg("NX");
        }
        let added: i64 = cmd
            .arg(due_at)
            .arg(job_id.as_str())
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("ZADD failed: {}", e)))?;
        Ok(added > 0)
    }

    fn index_score(&self, job_id: &JobId) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn()?;
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(self.keys.index())
            .arg(job_id.as_str())
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("ZSCORE failed: {}", e)))?;
        Ok(score.map(|s| s as i64))
    }

    fn index_peek_min(&self) -> Result<Option<IndexEntry>, StoreError> {
        let mut conn = self.conn()?;
        let rows: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(self.keys.index())
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("ZRANGE failed: {}", e)))?;
        Ok(entries(rows).into_iter().next())
    }

    #[instrument(skip(self), err)]
    fn index_pop_due(&self, max_due: i64, limit: usize) -> Result<Vec<IndexEntry>, StoreError> {
        let mut conn = self.conn()?;
        let rows: Vec<(String, f64)> = self
            .pop_due
            .key(self.keys.index())
            .arg(max_due)
            .arg(limit_arg(limit))
            .invoke(&mut conn)
            .map_err(|e| StoreError::Command(format!("pop-due script failed: {}", e)))?;
        Ok(entries(rows))
    }

    fn index_range(
        &self,
        min: Option<i64>,
        max: Option<i64>,
        limit: usize,
    ) -> Result<Vec<IndexEntry>, StoreError> {
        let mut conn = self.conn()?;
        let rows: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.index())
            .arg(bound(min, "-inf"))
            .arg(bound(max, "+inf"))
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(limit_arg(limit))
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("ZRANGEBYSCORE failed: {}", e)))?;
        Ok(entries(rows))
    }

    fn index_remove(&self, job_id: &JobId) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let removed: i64 = redis::cmd("ZREM")
            .arg(self.keys.index())
            .arg(job_id.as_str())
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("ZREM failed: {}", e)))?;
        Ok(removed > 0)
    }

    fn payload_put(
        &self,
        job_id: &JobId,
        payload: &str,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let _: () = redis::cmd("SET")
            .arg(self.keys.payload(job_id))
            .arg(payload)
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("SET failed: {}", e)))?;
        Ok(())
    }

    fn payload_get(&self, job_id: &JobId) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn()?;
        redis::cmd("GET")
            .arg(self.keys.payload(job_id))
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("GET failed: {}", e)))
    }

    fn payload_delete(&self, job_id: &JobId) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let removed: i64 = redis::cmd("DEL")
            .arg(self.keys.payload(job_id))
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("DEL failed: {}", e)))?;
        Ok(removed > 0)
    }

    fn entity_add(&self, payable_id: PayableId, job_id: &JobId) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let _: i64 = redis::cmd("SADD")
            .arg(self.keys.entity_set(payable_id))
            .arg(job_id.as_str())
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("SADD failed: {}", e)))?;
        Ok(())
    }

    fn entity_remove(&self, payable_id: PayableId, job_id: &JobId) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let _: i64 = redis::cmd("SREM")
            .arg(self.keys.entity_set(payable_id))
            .arg(job_id.as_str())
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("SREM failed: {}", e)))?;
        Ok(())
    }

    fn entity_members(&self, payable_id: PayableId) -> Result<Vec<JobId>, StoreError> {
        let mut conn = self.conn()?;
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.entity_set(payable_id))
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("SMEMBERS failed: {}", e)))?;
        Ok(members.into_iter().map(JobId::from_raw).collect())
    }

    fn entity_clear(&self, payable_id: PayableId) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let _: i64 = redis::cmd("DEL")
            .arg(self.keys.entity_set(payable_id))
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("DEL failed: {}", e)))?;
        Ok(())
    }

    #[instrument(skip(self, job_ids), fields(count = job_ids.len()), err)]
    fn purge(&self, job_ids: &[JobId]) -> Result<(), StoreError> {
        if job_ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn()?;
        let index = self.keys.index();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for job_id in job_ids {
            pipe.cmd("DEL").arg(self.keys.payload(job_id)).ignore();
            pipe.cmd("ZREM").arg(&index).arg(job_id.as_str()).ignore();
            if let Some(pid) = job_id.payable_id() {
                pipe.cmd("SREM")
                    .arg(self.keys.entity_set(pid))
                    .arg(job_id.as_str())
                    .ignore();
            }
        }
        let _: () = pipe
            .query(&mut conn)
            .map_err(|e| StoreError::Command(format!("purge pipeline failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let keys = KeySpace::default();
        let pid = PayableId::new();
        let job = JobId::for_reminder(pid, 1, 42);

        assert_eq!(keys.index(), "sched:payable_reminders");
        assert_eq!(keys.payload(&job), format!("sched:job:payable:{pid}:off:1:at:42"));
        assert_eq!(keys.entity_set(pid), format!("sched:jobs_by_entity:{pid}"));
    }

    #[test]
    fn custom_prefix_namespaces_every_key() {
        let keys = KeySpace::new("tenant-a:");
        assert!(keys.index().starts_with("tenant-a:"));
        assert!(keys.entity_set(PayableId::new()).starts_with("tenant-a:"));
    }

    #[test]
    fn unbounded_limit_maps_to_negative_count() {
        assert_eq!(limit_arg(50), 50);
        assert_eq!(limit_arg(usize::MAX), -1);
    }

    #[test]
    fn invalid_url_is_a_connection_error() {
        let err = RedisScheduleStore::new("not a url", KeySpace::default()).unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
    }

    #[test]
    fn env_store_uses_configured_prefix() {
        let config = ReminderConfig::default().with_key_prefix("billing:");
        if let Ok(store) = RedisScheduleStore::from_env(&config) {
            assert_eq!(store.keys().index(), "billing:payable_reminders");
        }
    }
}
