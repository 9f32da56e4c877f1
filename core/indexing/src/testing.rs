//! Deterministic stand-ins for the external capabilities.
//!
//! Used by unit tests here and by the pipeline's integration tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::classifier::{Classifier, ClassifyRequest};

type Responder = Box<dyn Fn(&ClassifyRequest) -> Option<Value> + Send + Sync>;

/// Classifier that answers from per-task scripts.
///
/// Lookup order for a task: queued one-shot responses, then the responder
/// closure, then the fixed fallback. A task with none of these is an error.
#[derive(Default)]
pub struct ScriptedClassifier {
    queued: Mutex<HashMap<String, VecDeque<Value>>>,
    responders: HashMap<String, Responder>,
    fallbacks: HashMap<String, Value>,
    calls: Mutex<Vec<ClassifyRequest>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot response for `task`.
    pub fn respond(self, task: &str, value: Value) -> Self {
        lock(&self.queued)
            .entry(task.to_string())
            .or_default()
            .push_back(value);
        self
    }

    /// Answer `task` from the request content; `None` falls through.
    pub fn respond_with<F>(mut self, task: &str, responder: F) -> Self
    where
        F: Fn(&ClassifyRequest) -> Option<Value> + Send + Sync + 'static,
    {
        self.responders.insert(task.to_string(), Box::new(responder));
        self
    }

    /// Answer every otherwise unscripted call to `task` with `value`.
    pub fn respond_always(mut self, task: &str, value: Value) -> Self {
        self.fallbacks.insert(task.to_string(), value);
        self
    }

    pub fn calls(&self) -> Vec<ClassifyRequest> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, task: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.task == task).count()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, request: &ClassifyRequest) -> Result<Value> {
        lock(&self.calls).push(request.clone());

        if let Some(value) = lock(&self.queued)
            .get_mut(&request.task)
            .and_then(|queue| queue.pop_front())
        {
            return Ok(value);
        }

        if let Some(value) = self
            .responders
            .get(&request.task)
            .and_then(|responder| responder(request))
        {
            return Ok(value);
        }

        self.fallbacks
            .get(&request.task)
            .cloned()
            .ok_or_else(|| anyhow!("No scripted response for task {}", request.task))
    }
}
