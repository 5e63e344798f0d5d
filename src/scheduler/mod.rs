//! Stream task scheduling: publisher uniqueness, player binding, node
//! selection, and the background timeout reaper.

use crate::auth::{AuthManager, AuthRequest, AuthVerdict};
use crate::config::SchedulerSettings;
use crate::models::{
    NodeCategory, NodeConfig, NodeEndpoint, StreamProtocol, StreamState, StreamTask, StreamType,
};
use crate::repository::{StateError, StreamStateStore};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    AuthFailed,
    AlreadyPublishing,
    NoPublisher,
    StateStoreError,
    Timeout,
    InternalError,
}

#[derive(Debug, Clone)]
pub enum SchedulerOutcome {
    Success(StreamTask),
    Failure {
        error: SchedulerError,
        message: String,
    },
}

impl SchedulerOutcome {
    fn failure(error: SchedulerError, message: impl Into<String>) -> SchedulerOutcome {
        SchedulerOutcome::Failure {
            error,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerMetrics {
    pub total_publish_req: u64,
    pub total_play_req: u64,
    pub success_pub: u64,
    pub success_play: u64,
    pub auth_failures: u64,
    pub tasks_cleaned: u64,
}

#[derive(Default)]
struct Counters {
    total_publish: AtomicU64,
    total_play: AtomicU64,
    success_pub: AtomicU64,
    success_play: AtomicU64,
    auth_failures: AtomicU64,
    tasks_cleaned: AtomicU64,
}

pub struct StreamTaskScheduler {
    auth: Arc<AuthManager>,
    state: Arc<dyn StreamStateStore>,
    nodes: Arc<NodeConfig>,
    settings: SchedulerSettings,
    next_task_id: AtomicU64,
    counters: Counters,
    shutdown_tx: Mutex<Option<watch::Sender<()>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl StreamTaskScheduler {
    pub fn new(
        auth: Arc<AuthManager>,
        state: Arc<dyn StreamStateStore>,
        nodes: Arc<NodeConfig>,
        settings: SchedulerSettings,
    ) -> StreamTaskScheduler {
        StreamTaskScheduler {
            auth,
            state,
            nodes,
            settings,
            next_task_id: AtomicU64::new(1),
            counters: Counters::default(),
            shutdown_tx: Mutex::new(None),
            reaper: Mutex::new(None),
        }
    }

    /// Spawn the background reaper. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.reaper.lock().expect("reaper lock");
        if guard.is_some() {
            return;
        }

        let (tx, mut rx) = watch::channel(());
        // Weak reference so an abandoned scheduler can still drop; the loop
        // exits on its own once the owner is gone.
        let scheduler = Arc::downgrade(self);
        let interval = self.settings.cleanup_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => {
                        info!("scheduler reaper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let Some(scheduler) = scheduler.upgrade() else { break };
                        scheduler.run_cleanup_cycle().await;
                    }
                }
            }
        });

        *self.shutdown_tx.lock().expect("shutdown lock") = Some(tx);
        *guard = Some(handle);
        info!(
            interval_secs = interval.as_secs(),
            "scheduler reaper started"
        );
    }

    /// Stop the reaper and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let tx = self.shutdown_tx.lock().expect("shutdown lock").take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        let handle = self.reaper.lock().expect("reaper lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!("scheduler stopped");
        }
    }

    /// One reaper pass: retire timed-out tasks, evicting the whole audience
    /// of any stream whose publisher died.
    pub async fn run_cleanup_cycle(&self) {
        let expired = self.state.scan_timeout_tasks(self.settings.task_timeout).await;
        if expired.is_empty() {
            return;
        }

        let mut dead_publisher_streams = HashSet::new();
        for task in &expired {
            self.counters.tasks_cleaned.fetch_add(1, Ordering::Relaxed);
            if task.task_type == StreamType::Publisher {
                dead_publisher_streams.insert(task.stream_name.clone());
            }
        }

        for stream_name in &dead_publisher_streams {
            warn!(stream = %stream_name, "publisher timed out, evicting audience");
            self.state.deregister_all_members(stream_name).await;
        }

        info!(reclaimed = expired.len(), "reaper cycle complete");
    }

    pub async fn on_publish(
        &self,
        stream_name: &str,
        client_id: &str,
        auth_token: &str,
        protocol: StreamProtocol,
    ) -> SchedulerOutcome {
        self.counters.total_publish.fetch_add(1, Ordering::Relaxed);
        if let Some(outcome) = validate_request(stream_name, client_id, auth_token) {
            return outcome;
        }

        match self.authorize(stream_name, client_id, auth_token).await {
            Ok(()) => {}
            Err(outcome) => return outcome,
        }

        let node = self.select_node(protocol);
        let task = self.create_task(
            stream_name,
            client_id,
            auth_token,
            StreamType::Publisher,
            protocol,
            node,
        );

        match self.state.register_task(&task).await {
            Ok(()) => {
                self.counters.success_pub.fetch_add(1, Ordering::Relaxed);
                SchedulerOutcome::Success(task)
            }
            Err(StateError::Conflict) => SchedulerOutcome::failure(
                SchedulerError::AlreadyPublishing,
                "stream already has an active publisher",
            ),
            Err(StateError::Backend(_)) => SchedulerOutcome::failure(
                SchedulerError::StateStoreError,
                "state registration failed",
            ),
        }
    }

    pub async fn on_play(
        &self,
        stream_name: &str,
        client_id: &str,
        auth_token: &str,
        protocol: StreamProtocol,
    ) -> SchedulerOutcome {
        self.counters.total_play.fetch_add(1, Ordering::Relaxed);
        if let Some(outcome) = validate_request(stream_name, client_id, auth_token) {
            return outcome;
        }

        match self.authorize(stream_name, client_id, auth_token).await {
            Ok(()) => {}
            Err(outcome) => return outcome,
        }

        let Some(publisher) = self.state.get_publisher_task(stream_name).await else {
            return SchedulerOutcome::failure(
                SchedulerError::NoPublisher,
                "no active publisher for stream",
            );
        };

        // Players are pinned to the node currently serving the publisher.
        let node = NodeEndpoint {
            host: publisher.server_ip.clone(),
            port: publisher.server_port,
        };
        let task = self.create_task(
            stream_name,
            client_id,
            auth_token,
            StreamType::Player,
            protocol,
            node,
        );

        match self.state.register_task(&task).await {
            Ok(()) => {
                self.counters.success_play.fetch_add(1, Ordering::Relaxed);
                SchedulerOutcome::Success(task)
            }
            Err(_) => SchedulerOutcome::failure(
                SchedulerError::StateStoreError,
                "state registration failed",
            ),
        }
    }

    /// Publisher exit: cascade-clean the stream, but only when the hook's
    /// sender really is the current publisher.
    pub async fn on_publish_done(&self, stream_name: &str, client_id: &str) {
        match self.state.get_task(stream_name, client_id).await {
            Some(task) if task.task_type == StreamType::Publisher => {
                info!(stream = %stream_name, client = %client_id, "publisher done, cascading cleanup");
                self.state.deregister_all_members(stream_name).await;
            }
            _ => {
                warn!(
                    stream = %stream_name,
                    client = %client_id,
                    "ignoring publish-done from a non-publisher"
                );
            }
        }
    }

    pub async fn on_play_done(&self, stream_name: &str, client_id: &str) {
        self.state.deregister_task(stream_name, client_id).await;
    }

    async fn authorize(
        &self,
        stream_name: &str,
        client_id: &str,
        auth_token: &str,
    ) -> Result<(), SchedulerOutcome> {
        let verdict = self
            .auth
            .authorize(AuthRequest {
                stream_key: stream_name.to_string(),
                client_id: client_id.to_string(),
                auth_token: auth_token.to_string(),
            })
            .await;

        match verdict {
            AuthVerdict::Success => Ok(()),
            AuthVerdict::Timeout => Err(SchedulerOutcome::failure(
                SchedulerError::Timeout,
                "authorization wait exceeded",
            )),
            AuthVerdict::Denied | AuthVerdict::RuntimeError => {
                self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
                Err(SchedulerOutcome::failure(
                    SchedulerError::AuthFailed,
                    "credential check rejected",
                ))
            }
        }
    }

    fn select_node(&self, protocol: StreamProtocol) -> NodeEndpoint {
        let category = NodeCategory::for_protocol(protocol);
        self.nodes.round_robin(category).unwrap_or_else(|| {
            warn!(protocol = protocol.as_str(), "no nodes for category, using loopback fallback");
            NodeEndpoint {
                host: "127.0.0.1".into(),
                port: 1935,
            }
        })
    }

    fn create_task(
        &self,
        stream_name: &str,
        client_id: &str,
        auth_token: &str,
        task_type: StreamType,
        protocol: StreamProtocol,
        node: NodeEndpoint,
    ) -> StreamTask {
        let now = Utc::now();
        StreamTask {
            task_id: self.next_task_id.fetch_add(1, Ordering::Relaxed),
            stream_name: stream_name.to_string(),
            client_id: client_id.to_string(),
            task_type,
            state: StreamState::Initializing,
            protocol,
            server_ip: node.host,
            server_port: node.port,
            start_time: now,
            last_active_time: now,
            user_id: String::new(),
            auth_token: auth_token.to_string(),
            region: None,
            need_transcode: false,
            need_record: false,
            transcoding_profile: String::new(),
        }
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        SchedulerMetrics {
            total_publish_req: self.counters.total_publish.load(Ordering::Relaxed),
            total_play_req: self.counters.total_play.load(Ordering::Relaxed),
            success_pub: self.counters.success_pub.load(Ordering::Relaxed),
            success_play: self.counters.success_play.load(Ordering::Relaxed),
            auth_failures: self.counters.auth_failures.load(Ordering::Relaxed),
            tasks_cleaned: self.counters.tasks_cleaned.load(Ordering::Relaxed),
        }
    }
}

impl Drop for StreamTaskScheduler {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.shutdown_tx.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(());
            }
        }
        if let Ok(mut guard) = self.reaper.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

fn validate_request(
    stream_name: &str,
    client_id: &str,
    auth_token: &str,
) -> Option<SchedulerOutcome> {
    if stream_name.is_empty() || client_id.is_empty() || auth_token.is_empty() {
        return Some(SchedulerOutcome::failure(
            SchedulerError::InternalError,
            "missing required fields",
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::AuthRepository;
    use crate::tests::fixtures::{auth_record, DbBehavior, FakeAuthDb, MemoryCache};
    use crate::tests::memory_state::MemoryStreamState;
    use crate::workers::WorkerPool;
    use std::time::Duration;

    struct Harness {
        scheduler: Arc<StreamTaskScheduler>,
        state: Arc<MemoryStreamState>,
    }

    fn harness_with(behavior: DbBehavior, auth_timeout: Duration, nodes: NodeConfig) -> Harness {
        let repository = Arc::new(AuthRepository::new(
            Arc::new(MemoryCache::default()),
            Arc::new(FakeAuthDb::new(behavior)),
            300,
        ));
        let auth = Arc::new(AuthManager::new(
            repository,
            Arc::new(WorkerPool::new(2, 64)),
            auth_timeout,
        ));
        let state = Arc::new(MemoryStreamState::new());
        let scheduler = Arc::new(StreamTaskScheduler::new(
            auth,
            state.clone(),
            Arc::new(nodes),
            SchedulerSettings {
                task_timeout: Duration::from_secs(60),
                cleanup_interval: Duration::from_millis(10),
            },
        ));
        Harness { scheduler, state }
    }

    fn harness(behavior: DbBehavior) -> Harness {
        let nodes = NodeConfig::new(
            vec![NodeEndpoint {
                host: "10.0.0.1".into(),
                port: 1935,
            }],
            vec![],
            vec![],
        );
        harness_with(behavior, Duration::from_secs(1), nodes)
    }

    #[tokio::test]
    async fn publish_registers_publisher_on_selected_node() {
        let h = harness(DbBehavior::Row(auth_record()));
        let outcome = h
            .scheduler
            .on_publish("vhost/live/abc", "cli1", "tok1", StreamProtocol::Rtmp)
            .await;

        let SchedulerOutcome::Success(task) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(task.server_ip, "10.0.0.1");
        assert_eq!(task.server_port, 1935);
        assert_eq!(h.state.active_publisher_count().await, 1);
        assert_eq!(h.scheduler.metrics().success_pub, 1);
    }

    #[tokio::test]
    async fn publish_with_bad_token_is_denied() {
        let h = harness(DbBehavior::Empty);
        let outcome = h
            .scheduler
            .on_publish("vhost/live/abc", "cli1", "wrong", StreamProtocol::Rtmp)
            .await;

        let SchedulerOutcome::Failure { error, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(error, SchedulerError::AuthFailed);
        assert_eq!(h.scheduler.metrics().auth_failures, 1);
        assert_eq!(h.state.active_publisher_count().await, 0);
    }

    #[tokio::test]
    async fn second_publisher_is_refused() {
        let h = harness(DbBehavior::Row(auth_record()));
        h.scheduler
            .on_publish("vhost/live/abc", "cli1", "tok1", StreamProtocol::Rtmp)
            .await;

        let outcome = h
            .scheduler
            .on_publish("vhost/live/abc", "cli2", "tok1", StreamProtocol::Rtmp)
            .await;
        let SchedulerOutcome::Failure { error, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(error, SchedulerError::AlreadyPublishing);
        assert_eq!(
            h.state.get_publisher_task("vhost/live/abc").await.unwrap().client_id,
            "cli1"
        );
    }

    #[tokio::test]
    async fn play_without_publisher_is_not_ready() {
        let h = harness(DbBehavior::Row(auth_record()));
        let outcome = h
            .scheduler
            .on_play("vhost/live/xyz", "cli2", "tok1", StreamProtocol::Hls)
            .await;

        let SchedulerOutcome::Failure { error, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(error, SchedulerError::NoPublisher);
    }

    #[tokio::test]
    async fn player_binds_to_publisher_node() {
        let h = harness(DbBehavior::Row(auth_record()));
        h.scheduler
            .on_publish("vhost/live/abc", "cli1", "tok1", StreamProtocol::Rtmp)
            .await;

        let outcome = h
            .scheduler
            .on_play("vhost/live/abc", "cli2", "tok1", StreamProtocol::Hls)
            .await;
        let SchedulerOutcome::Success(task) = outcome else {
            panic!("expected success");
        };

        let publisher = h.state.get_publisher_task("vhost/live/abc").await.unwrap();
        assert_eq!(task.server_ip, publisher.server_ip);
        assert_eq!(task.server_port, publisher.server_port);
        assert_eq!(task.task_type, StreamType::Player);
    }

    #[tokio::test]
    async fn empty_fields_are_an_internal_error() {
        let h = harness(DbBehavior::Row(auth_record()));
        let outcome = h
            .scheduler
            .on_publish("vhost/live/abc", "", "tok1", StreamProtocol::Rtmp)
            .await;
        let SchedulerOutcome::Failure { error, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(error, SchedulerError::InternalError);
    }

    #[tokio::test]
    async fn state_backend_failure_maps_to_store_error() {
        let h = harness(DbBehavior::Row(auth_record()));
        h.state.fail_next_register();

        let outcome = h
            .scheduler
            .on_publish("vhost/live/abc", "cli1", "tok1", StreamProtocol::Rtmp)
            .await;
        let SchedulerOutcome::Failure { error, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(error, SchedulerError::StateStoreError);
    }

    #[tokio::test]
    async fn slow_authorization_surfaces_timeout() {
        let nodes = NodeConfig::default();
        let h = harness_with(
            DbBehavior::SlowRow(Duration::from_millis(300)),
            Duration::from_millis(50),
            nodes,
        );

        let outcome = h
            .scheduler
            .on_publish("vhost/live/abc", "cli1", "tok1", StreamProtocol::Rtmp)
            .await;
        let SchedulerOutcome::Failure { error, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(error, SchedulerError::Timeout);
    }

    #[tokio::test]
    async fn publish_done_from_publisher_cascades() {
        let h = harness(DbBehavior::Row(auth_record()));
        h.scheduler
            .on_publish("vhost/live/abc", "cli1", "tok1", StreamProtocol::Rtmp)
            .await;
        h.scheduler
            .on_play("vhost/live/abc", "cli2", "tok1", StreamProtocol::Hls)
            .await;

        h.scheduler.on_publish_done("vhost/live/abc", "cli1").await;

        assert!(h.state.get_publisher_task("vhost/live/abc").await.is_none());
        assert!(h.state.get_task("vhost/live/abc", "cli2").await.is_none());
        assert!(h.state.stream_client_ids("vhost/live/abc").await.is_empty());
    }

    #[tokio::test]
    async fn publish_done_from_stranger_is_ignored() {
        let h = harness(DbBehavior::Row(auth_record()));
        h.scheduler
            .on_publish("vhost/live/abc", "cli1", "tok1", StreamProtocol::Rtmp)
            .await;

        // A player (or a spoofed client) sending publish-done changes nothing.
        h.scheduler.on_publish_done("vhost/live/abc", "cli9").await;
        assert!(h.state.get_publisher_task("vhost/live/abc").await.is_some());
    }

    #[tokio::test]
    async fn play_done_deregisters_single_task() {
        let h = harness(DbBehavior::Row(auth_record()));
        h.scheduler
            .on_publish("vhost/live/abc", "cli1", "tok1", StreamProtocol::Rtmp)
            .await;
        h.scheduler
            .on_play("vhost/live/abc", "cli2", "tok1", StreamProtocol::Hls)
            .await;

        h.scheduler.on_play_done("vhost/live/abc", "cli2").await;

        assert!(h.state.get_task("vhost/live/abc", "cli2").await.is_none());
        assert!(h.state.get_publisher_task("vhost/live/abc").await.is_some());
    }

    #[tokio::test]
    async fn cleanup_cycle_reaps_dead_publisher_and_audience() {
        let h = harness(DbBehavior::Row(auth_record()));
        h.scheduler
            .on_publish("vhost/live/abc", "cli1", "tok1", StreamProtocol::Rtmp)
            .await;
        h.scheduler
            .on_play("vhost/live/abc", "cli2", "tok1", StreamProtocol::Hls)
            .await;
        h.state
            .backdate("vhost/live/abc", "cli1", Duration::from_secs(120));

        h.scheduler.run_cleanup_cycle().await;

        assert!(h.state.get_publisher_task("vhost/live/abc").await.is_none());
        assert!(h.state.get_task("vhost/live/abc", "cli2").await.is_none());
        assert!(h.scheduler.metrics().tasks_cleaned >= 1);
    }

    #[tokio::test]
    async fn reaper_loop_runs_and_stops_promptly() {
        let h = harness(DbBehavior::Row(auth_record()));
        h.scheduler
            .on_publish("vhost/live/abc", "cli1", "tok1", StreamProtocol::Rtmp)
            .await;
        h.state
            .backdate("vhost/live/abc", "cli1", Duration::from_secs(120));

        h.scheduler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.state.get_publisher_task("vhost/live/abc").await.is_none());

        let start = std::time::Instant::now();
        h.scheduler.stop().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn empty_category_falls_back_to_loopback() {
        let h = harness_with(
            DbBehavior::Row(auth_record()),
            Duration::from_secs(1),
            NodeConfig::default(),
        );

        let outcome = h
            .scheduler
            .on_publish("vhost/live/abc", "cli1", "tok1", StreamProtocol::Rtmp)
            .await;
        let SchedulerOutcome::Success(task) = outcome else {
            panic!("expected success");
        };
        assert_eq!(task.server_ip, "127.0.0.1");
        assert_eq!(task.server_port, 1935);
    }
}
