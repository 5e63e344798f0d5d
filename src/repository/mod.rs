//! Shared-state repositories: the two-tier authorization resolver and the
//! Redis-backed stream session store.

pub mod auth;
pub mod stream_state;

pub use auth::{AuthDatabase, AuthDbError, AuthRepoError, AuthRepoStats, AuthRepository};
pub use stream_state::{
    RedisStreamState, StateError, StreamStateStore, TaskIdentifier, TASK_TTL_SECS,
};
