//! User-facing output channels: a voice sink and a structured event stream.
//! Both are append-only; under back-pressure the stream drops oldest log
//! events before touching reply events.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MAX_LOG_EVENTS: usize = 512;
const MAX_REPLY_EVENTS: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    StateChanged {
        state: String,
    },
    SegmentStarted {
        index: usize,
        mode: String,
        text: String,
    },
    StepStarted {
        step_id: u32,
        action: String,
    },
    StepCompleted {
        step_id: u32,
        success: bool,
    },
    /// Spoken in the target language by the voice channel.
    Voice {
        agent: String,
        message: String,
    },
    Reply {
        content: String,
    },
    UserPrompt {
        question: String,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

impl OrchestratorEvent {
    fn is_log(&self) -> bool {
        matches!(
            self,
            OrchestratorEvent::Log { .. } | OrchestratorEvent::StateChanged { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub event: OrchestratorEvent,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct EventStream {
    logs: Arc<Mutex<VecDeque<TimestampedEvent>>>,
    replies: Arc<Mutex<VecDeque<TimestampedEvent>>>,
}

impl EventStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: OrchestratorEvent) {
        let stamped = TimestampedEvent {
            event,
            timestamp: Utc::now(),
        };
        if stamped.event.is_log() {
            if let Ok(mut logs) = self.logs.lock() {
                if logs.len() >= MAX_LOG_EVENTS {
                    logs.pop_front();
                }
                logs.push_back(stamped);
            }
        } else if let Ok(mut replies) = self.replies.lock() {
            if replies.len() >= MAX_REPLY_EVENTS {
                // Reply events only drop once the log lane is already empty
                // of droppable history; shed logs first.
                if let Ok(mut logs) = self.logs.lock() {
                    if !logs.is_empty() {
                        logs.pop_front();
                    } else {
                        replies.pop_front();
                    }
                } else {
                    replies.pop_front();
                }
            }
            replies.push_back(stamped);
        }
    }

    pub fn voice(&self, agent: &str, message: &str) {
        tracing::info!(agent = %agent, "voice: {message}");
        self.publish(OrchestratorEvent::Voice {
            agent: agent.to_string(),
            message: message.to_string(),
        });
    }

    pub fn log(&self, message: impl Into<String>) {
        self.publish(OrchestratorEvent::Log {
            message: message.into(),
        });
    }

    pub fn drain_replies(&self) -> Vec<TimestampedEvent> {
        self.replies
            .lock()
            .map(|mut r| r.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn drain_logs(&self) -> Vec<TimestampedEvent> {
        self.logs
            .lock()
            .map(|mut l| l.drain(..).collect())
            .unwrap_or_default()
    }
}
