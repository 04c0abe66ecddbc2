//! SDK session runner
//!
//! Executes one LLM session to completion: streams chunks, mediates tool
//! permissions, persists inline artifacts (todos, candidate knowledge),
//! retries transient failures with capped backoff, and supports
//! cancellation through the session registry.

mod approvals;
mod registry;
mod session;

pub use approvals::{ApprovalBroker, ApprovalResponse};
pub use registry::{abortable_sleep, CancelToken, SessionRegistry};
pub use session::{retry_delay, SdkRunner, SessionParams, SessionResult, MAX_RETRIES, RETRY_DELAY_CAP};
