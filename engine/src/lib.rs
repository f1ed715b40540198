//! Job dispatch, model residency and supervision for relay.
//!
//! The crate's spine is [`Engine`]: one owned object holding the store, the
//! runtime client, the per-job subscription bus and the single-slot
//! residency manager, plus the background loops that keep an edge appliance
//! healthy: the streaming dispatcher, the readiness/auto-unload supervisor
//! and the stale-job reaper.

mod batch;
mod bus;
mod catalog;
mod dispatch;
mod engine;
mod reaper;
mod residency;
mod supervisor;
mod think;

pub use bus::{Subscription, SubscriptionBus};
pub use engine::{Engine, EngineError, EngineStatus, EnqueueError};
pub use residency::{
    Activation, BatchPick, ResidencyError, ResidencyManager, ResidencySettings,
};

// The producer-facing vocabulary, re-exported for callers that do not want
// to depend on relay-types directly.
pub use relay_types::{
    ChatMessage, ChatRole, EnqueueOptions, EnqueueReceipt, JobEvent, JobId, JobKind, JobPayload,
    JobStatus, QueueSnapshot,
};
