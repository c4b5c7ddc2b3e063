//! Operation controllers bound to views.
//!
//! - [`Operation`]: one async unit of work with stale-response discard
//! - [`RetryableOperation`]: adds scheduled backoff retries
//! - [`OptimisticOperation`]: adds speculative cache writes with rollback

mod controller;
mod optimistic;
mod retry;
mod scheduler;
mod state;

pub use controller::{Operation, ProgressReporter};
pub use optimistic::{MutationCoordinator, OptimisticOperation, OptimisticSnapshot, PendingMutation};
pub use retry::{RetryPolicy, RetryableOperation};
pub use scheduler::RetryScheduler;
pub use state::{OperationState, OperationStatus, ProgressInfo};
