//! Core domain types for relay.
//!
//! This crate defines the vocabulary shared by the store, the runtime client
//! and the engine: job identities and lifecycle, request payloads, subscriber
//! event shapes, and the model catalog. It has no IO and no async.

mod event;
mod ids;
mod job;
mod model;

pub use event::JobEvent;
pub use ids::{JobId, MessageId};
pub use job::{
    ChatMessage, ChatRole, EnqueueOptions, EnqueueReceipt, InvalidValue, Job, JobKind, JobPayload,
    JobStatus, PendingSnapshot, ProcessingSnapshot, QueueSnapshot,
};
pub use model::{
    CatalogEntry, InstallStatus, InstalledModel, LoadedModel, ModelSummary, SwitchReason,
    curated_catalog,
};
