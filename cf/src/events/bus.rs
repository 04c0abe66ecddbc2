//! Broadcast bus delivering events to all subscribers

use tokio::sync::broadcast;
use tracing::debug;

use super::types::PipelineEvent;

/// Default channel capacity (events). Streaming text chunks dominate the
/// volume; this buffers well over a minute of fast output.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Central event bus for ClawFlow activity streaming.
///
/// Components emit events; consumers (renderer bridge, loggers) subscribe.
/// Emission is fire-and-forget: no subscribers means the event is dropped,
/// and a lagging subscriber loses the oldest events rather than blocking
/// the emitters.
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: PipelineEvent) {
        debug!(kind = event.kind(), task_id = ?event.task_id(), "EventBus::emit");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Emitter handle bound to one task
    pub fn emitter_for(&self, task_id: i64) -> EventEmitter {
        EventEmitter {
            tx: self.tx.clone(),
            task_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Cheap-to-clone handle for emitting events with a pre-bound task id
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<PipelineEvent>,
    task_id: i64,
}

impl EventEmitter {
    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn stage_start(&self, stage: &str) {
        self.emit(PipelineEvent::StageStart {
            task_id: self.task_id,
            stage: stage.to_string(),
        });
    }

    pub fn stage_complete(&self, stage: &str, summary: &str) {
        self.emit(PipelineEvent::StageComplete {
            task_id: self.task_id,
            stage: stage.to_string(),
            summary: summary.to_string(),
        });
    }

    pub fn stage_error(&self, stage: &str, error: &str) {
        self.emit(PipelineEvent::StageError {
            task_id: self.task_id,
            stage: stage.to_string(),
            error: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StreamType;
    use chrono::Utc;

    fn stream_event(task_id: i64, content: &str) -> PipelineEvent {
        PipelineEvent::Stream {
            task_id,
            agent: "implement".to_string(),
            stream_type: StreamType::Text,
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_emit_receive() {
        let bus = EventBus::new(100);
        let mut rx = bus.subscribe();
        bus.emit(stream_event(1, "hello"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id(), Some(1));
        assert_eq!(event.kind(), "pipeline:stream");
    }

    #[tokio::test]
    async fn test_no_subscribers_does_not_panic() {
        let bus = EventBus::new(100);
        bus.emit(stream_event(1, "dropped"));
    }

    #[tokio::test]
    async fn test_stream_events_arrive_in_emission_order() {
        let bus = EventBus::new(1000);
        let mut rx = bus.subscribe();
        for i in 0..50 {
            bus.emit(stream_event(7, &format!("chunk{i}")));
        }
        for i in 0..50 {
            match rx.recv().await.unwrap() {
                PipelineEvent::Stream { content, .. } => assert_eq!(content, format!("chunk{i}")),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_interleaved_tasks_distinguishable() {
        let bus = EventBus::new(100);
        let mut rx = bus.subscribe();
        let a = bus.emitter_for(1);
        let b = bus.emitter_for(2);

        a.stage_start("plan");
        b.stage_start("implement");
        a.stage_complete("plan", "done");

        let mut for_a = Vec::new();
        let mut for_b = Vec::new();
        while let Ok(e) = rx.try_recv() {
            match e.task_id() {
                Some(1) => for_a.push(e.kind().to_string()),
                Some(2) => for_b.push(e.kind().to_string()),
                other => panic!("unexpected task id {other:?}"),
            }
        }
        assert_eq!(for_a, vec!["stage:start", "stage:complete"]);
        assert_eq!(for_b, vec!["stage:start"]);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_continues() {
        let bus = EventBus::new(5);
        let mut rx = bus.subscribe();
        for i in 0..20 {
            bus.emit(stream_event(1, &format!("t{i}")));
        }
        match rx.recv().await {
            Ok(event) => assert_eq!(event.kind(), "pipeline:stream"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                assert!(n > 0);
                assert!(rx.recv().await.is_ok());
            }
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }

    #[test]
    fn test_subscriber_count() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
        let _rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }
}
