//! Streaming conversation engine.
//!
//! Sends prompts to a generation server, decodes the incremental response,
//! extracts embedded tool events from the text channel, tracks which
//! conversations are generating in a store shared across processes, and
//! reconciles local conversations against server transcripts after an
//! interruption.
//!
//! Invariant: at most one locally-initiated stream per [`Engine`]; a new send
//! cancels the previous one.
//!
//! # Public API Overview
//! - Build an [`Engine`] from an [`EngineConfig`], or wire the parts yourself
//!   with [`ConversationLifecycle`] and [`ReconciliationSync`].
//! - Plug in a transport through the [`ChatBackend`] trait.
//! - Observe state through the watch channels on the conversation store, the
//!   generating registry and the lifecycle.

pub mod backend;
pub mod compaction;
pub mod config;
pub mod context_usage;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod phase;
pub mod reconcile;

pub use crate::backend::{ChatBackend, HttpBackend};
pub use crate::compaction::compaction_prompt;
pub use crate::config::{ContextThresholds, EngineConfig};
pub use crate::context_usage::{context_usage, ContextUsage, UsageLevel};
pub use crate::engine::Engine;
pub use crate::error::{EngineError, LifecycleError, SendOutcome, SyncOutcome};
pub use crate::lifecycle::ConversationLifecycle;
pub use crate::logging::init_logging;
pub use crate::phase::SendPhase;
pub use crate::reconcile::ReconciliationSync;
