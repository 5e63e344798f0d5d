//! Authorization manager: bounded-timeout and fire-and-forget front doors
//! over the two-tier resolver, running on the worker pool.

use crate::repository::AuthRepository;
use crate::workers::WorkerPool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub stream_key: String,
    pub client_id: String,
    pub auth_token: String,
}

/// Outcome delivered to asynchronous callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCode {
    Success,
    Denied,
    RuntimeError,
}

/// Scheduler-facing verdict: like [`AuthCode`] but with the bounded wait's
/// expiry made explicit so the hook layer can answer 504.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVerdict {
    Success,
    Denied,
    RuntimeError,
    Timeout,
}

pub type AuthCallback = Box<dyn FnOnce(AuthCode) + Send + 'static>;

pub struct AuthManager {
    repository: Arc<AuthRepository>,
    pool: Arc<WorkerPool>,
    timeout: Duration,
}

impl AuthManager {
    pub fn new(
        repository: Arc<AuthRepository>,
        pool: Arc<WorkerPool>,
        timeout: Duration,
    ) -> AuthManager {
        AuthManager {
            repository,
            pool,
            timeout,
        }
    }

    async fn resolve(repository: Arc<AuthRepository>, req: AuthRequest) -> AuthCode {
        match repository
            .get_auth_data(&req.stream_key, &req.client_id, &req.auth_token)
            .await
        {
            Ok(Some(data)) if data.is_authorized => AuthCode::Success,
            Ok(_) => AuthCode::Denied,
            Err(e) => {
                warn!(stream = %req.stream_key, error = %e, "auth resolution failed");
                AuthCode::RuntimeError
            }
        }
    }

    /// Submit the resolver call and receive the verdict on a oneshot.
    /// Returns `None` when the pool refuses the work.
    fn dispatch(&self, req: AuthRequest) -> Option<oneshot::Receiver<AuthCode>> {
        let (tx, rx) = oneshot::channel();
        let repository = self.repository.clone();
        let submitted = self.pool.submit(async move {
            let code = Self::resolve(repository, req).await;
            // The waiter may have timed out and gone; that is fine.
            let _ = tx.send(code);
        });
        submitted.ok().map(|_| rx)
    }

    /// Synchronous check with a bounded wait.
    ///
    /// On timeout the wait is abandoned — the underlying task still runs to
    /// completion and discards its result. Fails closed on every error.
    pub async fn check_auth(&self, stream_key: &str, client_id: &str, auth_token: &str) -> bool {
        self.authorize(AuthRequest {
            stream_key: stream_key.to_string(),
            client_id: client_id.to_string(),
            auth_token: auth_token.to_string(),
        })
        .await
            == AuthVerdict::Success
    }

    /// Bounded check with the full verdict, including `Timeout`.
    pub async fn authorize(&self, req: AuthRequest) -> AuthVerdict {
        let stream_key = req.stream_key.clone();
        let Some(rx) = self.dispatch(req) else {
            warn!(stream = %stream_key, "auth check rejected: worker pool unavailable");
            return AuthVerdict::RuntimeError;
        };

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(AuthCode::Success)) => AuthVerdict::Success,
            Ok(Ok(AuthCode::Denied)) => AuthVerdict::Denied,
            Ok(Ok(AuthCode::RuntimeError)) => AuthVerdict::RuntimeError,
            Ok(Err(_)) => {
                warn!(stream = %stream_key, "auth worker dropped its completion channel");
                AuthVerdict::RuntimeError
            }
            Err(_) => {
                debug!(stream = %stream_key, timeout_ms = self.timeout.as_millis() as u64, "auth wait timed out");
                AuthVerdict::Timeout
            }
        }
    }

    /// Fire-and-forget check. The callback runs on a worker task and is
    /// invoked exactly once; callers must not assume any particular thread.
    pub fn check_auth_async(&self, req: AuthRequest, callback: AuthCallback) {
        let slot = Arc::new(Mutex::new(Some(callback)));
        let job_slot = slot.clone();
        let repository = self.repository.clone();

        let submitted = self.pool.submit(async move {
            let code = Self::resolve(repository, req).await;
            if let Some(cb) = job_slot.lock().expect("callback slot").take() {
                cb(code);
            }
        });

        if submitted.is_err() {
            // The job will never run; complete the contract here.
            if let Some(cb) = slot.lock().expect("callback slot").take() {
                cb(AuthCode::RuntimeError);
            }
        }
    }
}
