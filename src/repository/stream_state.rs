//! Redis-backed stream session state: task hashes, indices, heartbeats and
//! optimistic timeout scanning.

use crate::cache::CacheClient;
use crate::models::{StreamProtocol, StreamState, StreamTask, StreamType};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// TTL applied to every `task:{stream}:{client}` hash.
pub const TASK_TTL_SECS: i64 = 60;

// Plausibility window for stored timestamps (2020-01-01 .. 2038-01-01 UTC).
// Anything outside is a corrupted record.
const MIN_REASONABLE_MS: i64 = 1_577_836_800_000;
const MAX_REASONABLE_MS: i64 = 2_145_916_800_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskIdentifier {
    pub stream_name: String,
    pub client_id: String,
    pub task_type: StreamType,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("stream already has a different publisher")]
    Conflict,

    #[error("state backend operation failed: {0}")]
    Backend(String),
}

/// Stream session state contract.
///
/// All mutating operations are idempotent with respect to reconnects, and
/// read-only operations answer empty/absent instead of failing when the
/// backend is unreachable.
#[async_trait]
pub trait StreamStateStore: Send + Sync {
    async fn register_task(&self, task: &StreamTask) -> Result<(), StateError>;
    async fn deregister_task(&self, stream_name: &str, client_id: &str) -> bool;
    async fn deregister_tasks_batch(&self, targets: &[TaskIdentifier]) -> usize;
    async fn deregister_all_members(&self, stream_name: &str);
    async fn touch_task(&self, stream_name: &str, client_id: &str) -> bool;
    async fn scan_timeout_tasks(&self, timeout: Duration) -> Vec<StreamTask>;

    async fn get_task(&self, stream_name: &str, client_id: &str) -> Option<StreamTask>;
    async fn get_publisher_task(&self, stream_name: &str) -> Option<StreamTask>;
    async fn get_player_tasks(&self, stream_name: &str) -> Vec<StreamTask>;
    async fn get_all_publisher_tasks(&self) -> Vec<StreamTask>;
    async fn active_publisher_count(&self) -> usize;
    async fn active_player_count(&self) -> usize;
    async fn player_count(&self, stream_name: &str) -> usize;
    async fn stream_client_ids(&self, stream_name: &str) -> Vec<String>;
    async fn is_healthy(&self) -> bool;
}

pub(crate) mod keys {
    pub const ACTIVE_PUBS: &str = "active_pubs";
    pub const GLOBAL_PLAYERS: &str = "global_players";
    pub const TASK_TIMESTAMPS: &str = "task_timestamps";

    pub fn task(stream_name: &str, client_id: &str) -> String {
        format!("task:{}:{}", stream_name, client_id)
    }

    pub fn publisher(stream_name: &str) -> String {
        format!("pub:{}", stream_name)
    }

    pub fn players(stream_name: &str) -> String {
        format!("players:{}", stream_name)
    }

    pub fn members(stream_name: &str) -> String {
        format!("stream:members:{}", stream_name)
    }
}

pub(crate) fn serialize_task(task: &StreamTask) -> Vec<(String, String)> {
    vec![
        ("stream_name".into(), task.stream_name.clone()),
        ("client_id".into(), task.client_id.clone()),
        ("active".into(), "1".into()),
        ("type".into(), task.task_type.as_str().into()),
        ("state".into(), task.state.as_str().into()),
        ("protocol".into(), task.protocol.as_str().into()),
        ("server_ip".into(), task.server_ip.clone()),
        ("server_port".into(), task.server_port.to_string()),
        (
            "start_time_ms".into(),
            task.start_time.timestamp_millis().to_string(),
        ),
        (
            "last_active_time_ms".into(),
            task.last_active_time.timestamp_millis().to_string(),
        ),
        ("user_id".into(), task.user_id.clone()),
        ("auth_token".into(), task.auth_token.clone()),
        ("region".into(), task.region.clone().unwrap_or_default()),
        (
            "need_transcode".into(),
            if task.need_transcode { "1" } else { "0" }.into(),
        ),
        (
            "need_record".into(),
            if task.need_record { "1" } else { "0" }.into(),
        ),
        (
            "transcoding_profile".into(),
            task.transcoding_profile.clone(),
        ),
    ]
}

pub(crate) fn deserialize_task(fields: &HashMap<String, String>) -> Option<StreamTask> {
    for required in [
        "stream_name",
        "client_id",
        "type",
        "start_time_ms",
        "last_active_time_ms",
    ] {
        if !fields.contains_key(required) {
            return None;
        }
    }

    let task_type = StreamType::parse(&fields["type"])?;

    let start_ms: i64 = fields["start_time_ms"].parse().ok()?;
    let last_ms: i64 = fields["last_active_time_ms"].parse().ok()?;
    if !(MIN_REASONABLE_MS..=MAX_REASONABLE_MS).contains(&start_ms)
        || !(MIN_REASONABLE_MS..=MAX_REASONABLE_MS).contains(&last_ms)
    {
        return None;
    }

    let field = |name: &str| fields.get(name).cloned().unwrap_or_default();

    Some(StreamTask {
        task_id: 0,
        stream_name: fields["stream_name"].clone(),
        client_id: fields["client_id"].clone(),
        task_type,
        state: fields
            .get("state")
            .map(|s| StreamState::parse(s))
            .unwrap_or_default(),
        protocol: fields
            .get("protocol")
            .map(|s| StreamProtocol::parse(s))
            .unwrap_or_default(),
        server_ip: field("server_ip"),
        server_port: fields
            .get("server_port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(0),
        start_time: ms_to_datetime(start_ms),
        last_active_time: ms_to_datetime(last_ms),
        user_id: field("user_id"),
        auth_token: field("auth_token"),
        region: fields.get("region").filter(|r| !r.is_empty()).cloned(),
        need_transcode: fields.get("need_transcode").map(String::as_str) == Some("1"),
        need_record: fields.get("need_record").map(String::as_str) == Some("1"),
        transcoding_profile: field("transcoding_profile"),
    })
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct RedisStreamState {
    cache: CacheClient,
}

impl RedisStreamState {
    pub fn new(cache: CacheClient) -> RedisStreamState {
        RedisStreamState { cache }
    }

    async fn get_task_by_key(&self, task_key: &str) -> Option<StreamTask> {
        let fields = self.cache.hget_all(task_key).await;
        if fields.is_empty() {
            return None;
        }
        deserialize_task(&fields)
    }

    /// Publisher indices: the `pub:{stream}` hash doubles as the
    /// unique-publisher lock.
    async fn register_publisher_indices(&self, task: &StreamTask) -> Result<(), StateError> {
        let pub_key = keys::publisher(&task.stream_name);

        // Re-check under the lock key: another publisher may have landed
        // between the caller's check and this write.
        if let Some(current) = self.get_task_by_key(&pub_key).await {
            if current.client_id != task.client_id {
                warn!(
                    stream = %task.stream_name,
                    holder = %current.client_id,
                    "publisher slot already taken"
                );
                return Err(StateError::Conflict);
            }
        }

        let mut pipe = redis::pipe();
        pipe.hset_multiple(&pub_key, &serialize_task(task))
            .sadd(keys::members(&task.stream_name), &task.client_id)
            .sadd(keys::ACTIVE_PUBS, &task.stream_name);

        self.cache
            .exec_pipeline::<()>(&pipe)
            .await
            .ok_or_else(|| StateError::Backend("publisher index pipeline failed".into()))
    }

    async fn register_player_indices(&self, task: &StreamTask) -> Result<(), StateError> {
        let mut pipe = redis::pipe();
        pipe.sadd(keys::members(&task.stream_name), &task.client_id)
            .sadd(keys::players(&task.stream_name), &task.client_id);

        let (_, newly_added): (i64, i64) = self
            .cache
            .exec_pipeline(&pipe)
            .await
            .ok_or_else(|| StateError::Backend("player index pipeline failed".into()))?;

        // The global gauge counts distinct player memberships; only a
        // non-member -> member transition moves it.
        if newly_added > 0
            && self
                .cache
                .hincr(keys::GLOBAL_PLAYERS, "total", 1)
                .await
                .is_none()
        {
            warn!(stream = %task.stream_name, "global player gauge increment failed");
        }
        Ok(())
    }

    /// Rollback helper: failures after the task hash exists are undone by a
    /// plain deregister.
    async fn rollback(&self, task: &StreamTask) {
        self.deregister_task(&task.stream_name, &task.client_id)
            .await;
    }

    async fn reconcile_global_players(&self) {
        let fields = self.cache.hget_all(keys::GLOBAL_PLAYERS).await;
        if let Some(total) = fields.get("total").and_then(|t| t.parse::<i64>().ok()) {
            if total < 0 {
                warn!(total, "global player gauge went negative, resetting");
                self.cache
                    .hset_all(keys::GLOBAL_PLAYERS, &[("total".into(), "0".into())])
                    .await;
            }
        }
    }
}

#[async_trait]
impl StreamStateStore for RedisStreamState {
    async fn register_task(&self, task: &StreamTask) -> Result<(), StateError> {
        if task.stream_name.is_empty() || task.client_id.is_empty() {
            return Err(StateError::Backend(
                "task identity must be non-empty".into(),
            ));
        }

        let task_key = keys::task(&task.stream_name, &task.client_id);

        if task.task_type == StreamType::Publisher {
            if let Some(existing) = self.get_publisher_task(&task.stream_name).await {
                if existing.client_id != task.client_id {
                    warn!(
                        stream = %task.stream_name,
                        holder = %existing.client_id,
                        candidate = %task.client_id,
                        "refusing second publisher"
                    );
                    return Err(StateError::Conflict);
                }
                // Same identity reconnecting: clear the previous session
                // before installing the new one.
                info!(stream = %task.stream_name, client = %task.client_id, "publisher reconnect, clearing old state");
                self.deregister_task(&task.stream_name, &task.client_id)
                    .await;
            }
        } else if self.cache.exists(&task_key).await {
            info!(stream = %task.stream_name, client = %task.client_id, "player reconnect, clearing old state");
            self.deregister_task(&task.stream_name, &task.client_id)
                .await;
        }

        if !self.cache.hset_all(&task_key, &serialize_task(task)).await {
            error!(%task_key, "task hash write failed");
            return Err(StateError::Backend("task hash write failed".into()));
        }

        if !self.cache.expire(&task_key, TASK_TTL_SECS).await {
            error!(%task_key, "task TTL install failed, rolling back");
            self.cache.del(&task_key).await;
            return Err(StateError::Backend("task TTL install failed".into()));
        }

        let index_result = match task.task_type {
            StreamType::Publisher => self.register_publisher_indices(task).await,
            StreamType::Player => self.register_player_indices(task).await,
        };
        if let Err(e) = index_result {
            error!(%task_key, error = %e, "index registration failed, rolling back");
            self.rollback(task).await;
            return Err(e);
        }

        let now = now_ms();
        if !(MIN_REASONABLE_MS..=MAX_REASONABLE_MS).contains(&now) {
            error!(now, "clock outside plausible range, rolling back");
            self.rollback(task).await;
            return Err(StateError::Backend("implausible wall clock".into()));
        }

        if !self
            .cache
            .zadd(keys::TASK_TIMESTAMPS, now as f64, &task_key)
            .await
        {
            error!(%task_key, "timestamp index write failed, rolling back");
            self.rollback(task).await;
            return Err(StateError::Backend("timestamp index write failed".into()));
        }

        info!(
            stream = %task.stream_name,
            client = %task.client_id,
            task_type = task.task_type.as_str(),
            "task registered"
        );
        Ok(())
    }

    async fn deregister_task(&self, stream_name: &str, client_id: &str) -> bool {
        match self.get_task(stream_name, client_id).await {
            None => {
                // Nothing to remove, but a stale timestamp entry may remain.
                let task_key = keys::task(stream_name, client_id);
                self.cache.zrem(keys::TASK_TIMESTAMPS, &task_key).await;
                true
            }
            Some(task) => {
                let targets = [TaskIdentifier {
                    stream_name: stream_name.to_string(),
                    client_id: client_id.to_string(),
                    task_type: task.task_type,
                }];
                self.deregister_tasks_batch(&targets).await > 0
            }
        }
    }

    async fn deregister_tasks_batch(&self, targets: &[TaskIdentifier]) -> usize {
        if targets.is_empty() {
            return 0;
        }

        let mut pipe = redis::pipe();
        let mut players_removed = false;
        for target in targets {
            pipe.del(keys::task(&target.stream_name, &target.client_id));
            pipe.srem(keys::members(&target.stream_name), &target.client_id);

            match target.task_type {
                StreamType::Player => {
                    players_removed = true;
                    pipe.srem(keys::players(&target.stream_name), &target.client_id);
                    pipe.hincr(keys::GLOBAL_PLAYERS, "total", -1);
                }
                StreamType::Publisher => {
                    pipe.del(keys::publisher(&target.stream_name));
                    pipe.srem(keys::ACTIVE_PUBS, &target.stream_name);
                }
            }
        }

        if self.cache.exec_pipeline::<()>(&pipe).await.is_none() {
            error!(count = targets.len(), "batch deregistration pipeline failed");
            return 0;
        }

        if players_removed {
            self.reconcile_global_players().await;
        }
        targets.len()
    }

    async fn deregister_all_members(&self, stream_name: &str) {
        let member_key = keys::members(stream_name);
        let player_key = keys::players(stream_name);
        let client_ids = self.stream_client_ids(stream_name).await;

        if client_ids.is_empty() {
            self.cache.del(&member_key).await;
            self.cache.del(&player_key).await;
            return;
        }

        let mut targets = Vec::with_capacity(client_ids.len());
        for client_id in &client_ids {
            if let Some(task) = self.get_task(stream_name, client_id).await {
                targets.push(TaskIdentifier {
                    stream_name: stream_name.to_string(),
                    client_id: client_id.clone(),
                    task_type: task.task_type,
                });
            }
        }

        self.deregister_tasks_batch(&targets).await;

        self.cache.del(&member_key).await;
        self.cache.del(&player_key).await;
        info!(stream = %stream_name, members = client_ids.len(), "stream members cleared");
    }

    async fn touch_task(&self, stream_name: &str, client_id: &str) -> bool {
        let task_key = keys::task(stream_name, client_id);
        let now = now_ms();

        // EXPIRE runs first so its reply still distinguishes a live task
        // from one already reaped; the HSET below would otherwise recreate
        // the hash and mask the absence.
        let mut pipe = redis::pipe();
        pipe.expire(&task_key, TASK_TTL_SECS)
            .hset(&task_key, "last_active_time_ms", now.to_string())
            .zadd(keys::TASK_TIMESTAMPS, &task_key, now as f64);

        let Some((refreshed, _, _)) = self.cache.exec_pipeline::<(i64, i64, i64)>(&pipe).await
        else {
            error!(%task_key, "touch pipeline failed");
            return false;
        };

        if refreshed == 0 {
            // The task expired between heartbeats; drop the hash the HSET
            // just recreated.
            debug!(%task_key, "touch raced task expiry, cleaning orphan");
            self.cache.del(&task_key).await;
            return false;
        }
        true
    }

    async fn scan_timeout_tasks(&self, timeout: Duration) -> Vec<StreamTask> {
        let now = now_ms();
        let timeout_ms = timeout.as_millis() as i64;
        let cutoff = (now - timeout_ms) as f64;

        let candidates = self
            .cache
            .zrange_by_score(keys::TASK_TIMESTAMPS, 0.0, cutoff)
            .await;

        let mut expired = Vec::new();
        for task_key in candidates {
            // Claim ownership; losing the race means another scanner is
            // handling this entry.
            if !self.cache.zrem(keys::TASK_TIMESTAMPS, &task_key).await {
                continue;
            }

            let Some(task) = self.get_task_by_key(&task_key).await else {
                continue;
            };

            let last_active = task.last_active_time.timestamp_millis();
            if now - last_active < timeout_ms {
                // Touched after the range snapshot; give the entry back with
                // its true score.
                self.cache
                    .zadd(keys::TASK_TIMESTAMPS, last_active as f64, &task_key)
                    .await;
                continue;
            }

            self.deregister_task(&task.stream_name, &task.client_id)
                .await;
            expired.push(task);
        }
        expired
    }

    async fn get_task(&self, stream_name: &str, client_id: &str) -> Option<StreamTask> {
        self.get_task_by_key(&keys::task(stream_name, client_id))
            .await
    }

    async fn get_publisher_task(&self, stream_name: &str) -> Option<StreamTask> {
        let fields = self.cache.hget_all(&keys::publisher(stream_name)).await;
        if fields.is_empty() || fields.get("active").map(String::as_str) != Some("1") {
            return None;
        }
        deserialize_task(&fields)
    }

    async fn get_player_tasks(&self, stream_name: &str) -> Vec<StreamTask> {
        let mut tasks = Vec::new();
        for client_id in self.cache.smembers(&keys::players(stream_name)).await {
            if let Some(task) = self.get_task(stream_name, &client_id).await {
                tasks.push(task);
            }
        }
        tasks
    }

    async fn get_all_publisher_tasks(&self) -> Vec<StreamTask> {
        let mut tasks = Vec::new();
        for stream_name in self.cache.smembers(keys::ACTIVE_PUBS).await {
            if let Some(task) = self.get_publisher_task(&stream_name).await {
                tasks.push(task);
            }
        }
        tasks
    }

    async fn active_publisher_count(&self) -> usize {
        self.cache.scard(keys::ACTIVE_PUBS).await
    }

    async fn active_player_count(&self) -> usize {
        self.cache
            .hget_all(keys::GLOBAL_PLAYERS)
            .await
            .get("total")
            .and_then(|t| t.parse::<i64>().ok())
            .map(|t| t.max(0) as usize)
            .unwrap_or(0)
    }

    async fn player_count(&self, stream_name: &str) -> usize {
        self.cache.scard(&keys::players(stream_name)).await
    }

    async fn stream_client_ids(&self, stream_name: &str) -> Vec<String> {
        self.cache.smembers(&keys::members(stream_name)).await
    }

    async fn is_healthy(&self) -> bool {
        self.cache.ping().await
    }
}
