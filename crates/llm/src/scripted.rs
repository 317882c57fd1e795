//! Scripted backend test double.  Plays back a queue of outcomes and records
//! every prompt it receives.  Used by unit and integration tests in place of
//! network providers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{BackendReply, GenerationBackend};

#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    Fail(String),
    /// Never answers; only the caller's timeout ends the call.
    Hang,
}

#[derive(Debug)]
pub struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    /// A backend that always answers `reply`.
    pub fn healthy(name: &str, reply: &str) -> Self {
        Self::new(name, Step::Reply(reply.to_string()))
    }

    /// A backend that always fails.
    pub fn broken(name: &str) -> Self {
        Self::new(name, Step::Fail(format!("{name} is down")))
    }

    pub fn new(name: &str, fallback: Step) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue steps played before the fallback behaviour resumes.
    pub fn then(self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script.lock().extend(steps);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ask(&self, prompt: &str, _client_id: &str, _persona_id: &str) -> BackendReply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());
        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match step {
            Step::Reply(text) => BackendReply::ok(text, Duration::from_millis(1)),
            Step::Fail(error) => BackendReply::failed(error, Duration::from_millis(1)),
            Step::Hang => {
                std::future::pending::<()>().await;
                BackendReply::failed("unreachable", Duration::ZERO)
            }
        }
    }
}
