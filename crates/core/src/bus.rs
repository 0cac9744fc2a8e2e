//! In-process message bus between the agents.
//!
//! Agents never call each other directly; the orchestrator is the only loop
//! controller and typed messages flow through bounded per-recipient queues.
//! The auditor's rejection for step N is drained synchronously at the top of
//! the executor's next attempt, which is what guarantees ordering.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MAX_QUEUE_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentId {
    Strategist,
    Executor,
    Auditor,
    Orchestrator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusPayload {
    /// Auditor -> Executor: structured rejection of a step.
    Rejection {
        step_id: u32,
        report: String,
        issues: Vec<String>,
    },
    /// Executor -> Strategist (via orchestrator): a question mid-step.
    HelpRequest { step_id: u32, question: String },
    /// Strategist's answer to a help request.
    Response { step_id: u32, content: String },
    /// A user (or autonomous) answer to a consent prompt.
    UserResponse { content: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub from: AgentId,
    pub payload: BusPayload,
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    pub fn new(from: AgentId, payload: BusPayload) -> Self {
        Self {
            from,
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Default)]
pub struct AgentBus {
    queues: Arc<Mutex<HashMap<AgentId, VecDeque<BusMessage>>>>,
}

impl AgentBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, to: AgentId, message: BusMessage) {
        let Ok(mut queues) = self.queues.lock() else {
            return;
        };
        let queue = queues.entry(to).or_default();
        if queue.len() >= MAX_QUEUE_LEN {
            queue.pop_front();
        }
        queue.push_back(message);
    }

    /// Remove and return every queued message for a recipient, oldest first.
    pub fn drain(&self, recipient: AgentId) -> Vec<BusMessage> {
        let Ok(mut queues) = self.queues.lock() else {
            return Vec::new();
        };
        queues
            .get_mut(&recipient)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, recipient: AgentId) -> usize {
        self.queues
            .lock()
            .map(|q| q.get(&recipient).map(VecDeque::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Oldest queued user (or autonomous) answer for the executor.
    pub fn take_user_response(&self) -> Option<String> {
        let Ok(mut queues) = self.queues.lock() else {
            return None;
        };
        let queue = queues.get_mut(&AgentId::Executor)?;
        let position = queue
            .iter()
            .position(|m| matches!(&m.payload, BusPayload::UserResponse { .. }))?;
        let message = queue.remove(position)?;
        match message.payload {
            BusPayload::UserResponse { content } => Some(content),
            _ => None,
        }
    }

    /// Strategist's answer to a help request for a step.
    pub fn take_response_for(&self, step_id: u32) -> Option<String> {
        let Ok(mut queues) = self.queues.lock() else {
            return None;
        };
        let queue = queues.get_mut(&AgentId::Executor)?;
        let position = queue.iter().position(|m| {
            matches!(&m.payload, BusPayload::Response { step_id: s, .. } if *s == step_id)
        })?;
        let message = queue.remove(position)?;
        match message.payload {
            BusPayload::Response { content, .. } => Some(content),
            _ => None,
        }
    }

    /// Latest rejection report for a step, if one is queued.
    pub fn take_rejection_for(&self, step_id: u32) -> Option<(String, Vec<String>)> {
        let Ok(mut queues) = self.queues.lock() else {
            return None;
        };
        let queue = queues.get_mut(&AgentId::Executor)?;
        let position = queue.iter().rposition(|m| {
            matches!(&m.payload, BusPayload::Rejection { step_id: s, .. } if *s == step_id)
        })?;
        let message = queue.remove(position)?;
        match message.payload {
            BusPayload::Rejection { report, issues, .. } => Some((report, issues)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_preserves_order() {
        let bus = AgentBus::new();
        for i in 0..3 {
            bus.send(
                AgentId::Executor,
                BusMessage::new(
                    AgentId::Auditor,
                    BusPayload::Response {
                        step_id: i,
                        content: format!("msg {i}"),
                    },
                ),
            );
        }
        let messages = bus.drain(AgentId::Executor);
        assert_eq!(messages.len(), 3);
        assert!(matches!(
            &messages[0].payload,
            BusPayload::Response { step_id: 0, .. }
        ));
        assert_eq!(bus.pending_count(AgentId::Executor), 0);
    }

    #[test]
    fn test_take_rejection_for_step() {
        let bus = AgentBus::new();
        bus.send(
            AgentId::Executor,
            BusMessage::new(
                AgentId::Auditor,
                BusPayload::Rejection {
                    step_id: 2,
                    report: "wrong file".to_string(),
                    issues: vec!["path missing".to_string()],
                },
            ),
        );
        bus.send(
            AgentId::Executor,
            BusMessage::new(
                AgentId::Orchestrator,
                BusPayload::UserResponse {
                    content: "Espresso.".to_string(),
                },
            ),
        );

        let (report, issues) = bus.take_rejection_for(2).unwrap();
        assert_eq!(report, "wrong file");
        assert_eq!(issues.len(), 1);
        // The unrelated message stays queued.
        assert_eq!(bus.pending_count(AgentId::Executor), 1);
        assert!(bus.take_rejection_for(2).is_none());
    }

    #[test]
    fn test_bounded_queue_drops_oldest() {
        let bus = AgentBus::new();
        for i in 0..(MAX_QUEUE_LEN + 5) {
            bus.send(
                AgentId::Strategist,
                BusMessage::new(
                    AgentId::Executor,
                    BusPayload::HelpRequest {
                        step_id: i as u32,
                        question: String::new(),
                    },
                ),
            );
        }
        let messages = bus.drain(AgentId::Strategist);
        assert_eq!(messages.len(), MAX_QUEUE_LEN);
        assert!(matches!(
            &messages[0].payload,
            BusPayload::HelpRequest { step_id: 5, .. }
        ));
    }
}
