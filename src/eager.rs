//! FIFO queue of asynchronously generated status messages awaiting merge
//! into the planner's next turn.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct EagerPrompt {
    pub execution_id: String,
    pub message: String,
    pub log_delta: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
pub struct EagerPromptQueue {
    inner: Mutex<VecDeque<EagerPrompt>>,
}

impl EagerPromptQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, execution_id: &str, message: String, log_delta: String) {
        let mut queue = self.inner.lock().expect("eager prompt queue lock");
        queue.push_back(EagerPrompt {
            execution_id: execution_id.to_string(),
            message,
            log_delta,
            timestamp: Utc::now(),
        });
    }

    /// Take every queued prompt in arrival order. Drained prompts are gone;
    /// each is consumed exactly once.
    pub fn drain(&self) -> Vec<EagerPrompt> {
        let mut queue = self.inner.lock().expect("eager prompt queue lock");
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("eager prompt queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_is_strict_fifo() {
        let queue = EagerPromptQueue::new();
        queue.push("exec-1", "first".into(), "a".into());
        queue.push("exec-2", "second".into(), "b".into());
        queue.push("exec-1", "third".into(), "c".into());

        let drained = queue.drain();
        let messages: Vec<&str> = drained.iter().map(|p| p.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
    }

    #[test]
    fn drain_consumes_exactly_once() {
        let queue = EagerPromptQueue::new();
        queue.push("exec-1", "only".into(), "delta".into());
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.drain().is_empty());
        assert!(queue.is_empty());
    }
}
