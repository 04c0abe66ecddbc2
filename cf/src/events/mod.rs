//! Event vocabulary and broadcast bus
//!
//! Every significant action in the core emits a [`PipelineEvent`] to the
//! [`EventBus`]. The renderer (and any logger) subscribes; events are
//! idempotent updates delivered in emission order per task.

mod bus;
mod types;

pub use bus::{EventBus, EventEmitter, DEFAULT_CHANNEL_CAPACITY};
pub use types::{PipelineEvent, StreamType};
