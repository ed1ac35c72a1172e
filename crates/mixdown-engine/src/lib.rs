//! The mixdown job orchestration engine: validation, graph planning,
//! dispatch, status consumption, caching, retry, and the worker-facing
//! hydration API.
//!
//! The engine holds no state of its own; everything durable lives behind
//! the store/bus/cache traits from `mixdown-core`. The planner is a pure
//! function over the job document, and every mutation goes through a
//! per-job compare-and-swap, so any number of consumer tasks can apply
//! status events concurrently.

pub mod cache_key;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod retry;
pub mod sweeper;
pub mod template;
pub mod validate;

pub use error::EngineError;
pub use orchestrator::{HydratedStep, Orchestrator, OrchestratorHandle, RetryReceipt, SubmitReceipt};
pub use plan::{Plan, Verdict};
pub use validate::ValidationError;
