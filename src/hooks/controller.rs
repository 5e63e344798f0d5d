//! Hook action routing.

use crate::error::HookResult;
use crate::hooks::use_case::HookUseCase;
use crate::models::{HookAction, HookRequest, HookResponse};
use tracing::warn;

pub struct HookController {
    use_case: HookUseCase,
}

impl HookController {
    pub fn new(use_case: HookUseCase) -> HookController {
        HookController { use_case }
    }

    pub async fn route(&self, hook: &HookRequest) -> HookResponse {
        match hook.action {
            HookAction::Publish => self.use_case.process_publish(hook).await.to_response(),
            HookAction::Play => self.use_case.process_play(hook).await.to_response(),
            // A stream nobody watches and a stream whose publisher left are
            // both "stream over" for session-tracking purposes.
            HookAction::PublishDone | HookAction::StreamNoneReader => {
                self.use_case.process_publish_done(hook).await.to_response()
            }
            HookAction::PlayDone => self.use_case.process_play_done(hook).await.to_response(),
            HookAction::StreamNotFound | HookAction::Unknown => {
                warn!(action = hook.action.as_str(), "unsupported hook action");
                HookResponse::new(HookResult::UnsupportedAction, "Unsupported action")
            }
        }
    }
}
