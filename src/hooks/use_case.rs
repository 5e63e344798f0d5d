//! Protocol-neutral hook business logic.

use crate::models::{HookDecision, HookRequest};
use crate::scheduler::{SchedulerError, SchedulerOutcome, StreamTaskScheduler};
use std::sync::Arc;
use tracing::info;

pub struct HookUseCase {
    scheduler: Arc<StreamTaskScheduler>,
}

impl HookUseCase {
    pub fn new(scheduler: Arc<StreamTaskScheduler>) -> HookUseCase {
        HookUseCase { scheduler }
    }

    pub async fn process_publish(&self, hook: &HookRequest) -> HookDecision {
        let outcome = self
            .scheduler
            .on_publish(
                &hook.stream_key(),
                &hook.client_id,
                &hook.token(),
                hook.protocol,
            )
            .await;
        map_outcome(outcome)
    }

    pub async fn process_play(&self, hook: &HookRequest) -> HookDecision {
        info!(stream = %hook.stream, "processing play request");
        let outcome = self
            .scheduler
            .on_play(
                &hook.stream_key(),
                &hook.client_id,
                &hook.token(),
                hook.protocol,
            )
            .await;
        map_outcome(outcome)
    }

    /// Stream teardown is always acknowledged; the cleanup is a side effect.
    pub async fn process_publish_done(&self, hook: &HookRequest) -> HookDecision {
        self.scheduler
            .on_publish_done(&hook.stream_key(), &hook.client_id)
            .await;
        HookDecision::allow()
    }

    pub async fn process_play_done(&self, hook: &HookRequest) -> HookDecision {
        self.scheduler
            .on_play_done(&hook.stream_key(), &hook.client_id)
            .await;
        HookDecision::allow()
    }
}

fn map_outcome(outcome: SchedulerOutcome) -> HookDecision {
    match outcome {
        SchedulerOutcome::Success(_) => HookDecision::allow(),
        SchedulerOutcome::Failure {
            error: SchedulerError::NoPublisher,
            message,
        } => HookDecision::NotReady(message),
        SchedulerOutcome::Failure {
            error: SchedulerError::Timeout,
            ..
        } => HookDecision::Defer,
        SchedulerOutcome::Failure { message, .. } => HookDecision::deny(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StreamTask;
    use crate::tests::fixtures::publisher_task;

    fn success() -> SchedulerOutcome {
        SchedulerOutcome::Success(publisher_task("s", "c"))
    }

    fn failure(error: SchedulerError) -> SchedulerOutcome {
        SchedulerOutcome::Failure {
            error,
            message: "m".into(),
        }
    }

    #[test]
    fn outcome_mapping() {
        assert_eq!(map_outcome(success()), HookDecision::Allow);
        assert_eq!(
            map_outcome(failure(SchedulerError::NoPublisher)),
            HookDecision::NotReady("m".into())
        );
        assert_eq!(map_outcome(failure(SchedulerError::Timeout)), HookDecision::Defer);
        assert_eq!(
            map_outcome(failure(SchedulerError::AuthFailed)),
            HookDecision::Deny("m".into())
        );
        assert_eq!(
            map_outcome(failure(SchedulerError::AlreadyPublishing)),
            HookDecision::Deny("m".into())
        );
    }

    #[test]
    fn success_preserves_no_task_details_in_decision() {
        // The decision layer is deliberately lossy; node placement travels
        // through state, not through the hook reply.
        let task: StreamTask = publisher_task("s", "c");
        let decision = map_outcome(SchedulerOutcome::Success(task));
        assert_eq!(decision, HookDecision::Allow);
    }
}
