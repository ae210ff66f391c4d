//! Recording fakes for the external collaborators, with no side effects.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::alerts::{Alerter, FailureAlert};
use crate::broadcast::{Frame, SinkError, StreamSink};
use crate::error::GuardrailError;
use crate::provider::{CompletionRequest, CompletionResponse, ComputeProvider};

/// Alerter that stores every alert it is asked to send
#[derive(Debug, Default)]
pub struct RecordingAlerter {
    failures: Mutex<Vec<FailureAlert>>,
    budgets: Mutex<Vec<String>>,
}

impl RecordingAlerter {
    pub fn failure_alerts(&self) -> Vec<FailureAlert> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn budget_alerts(&self) -> Vec<String> {
        self.budgets.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Alerter for RecordingAlerter {
    async fn send_failure_alert(&self, alert: &FailureAlert) -> anyhow::Result<()> {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(alert.clone());
        Ok(())
    }

    async fn send_budget_alert(&self, text: &str) -> anyhow::Result<()> {
        self.budgets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());
        Ok(())
    }
}

/// Provider that replays queued responses in order and records requests.
///
/// An empty script answers with an empty completion and zero usage.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<CompletionResponse, GuardrailError>>>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn push_ok(&self, output: &str, input_units: u64, output_units: u64) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(CompletionResponse {
                output: output.to_string(),
                input_units,
                output_units,
            }));
    }

    pub fn push_err(&self, error: GuardrailError) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(error));
    }

    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ComputeProvider for ScriptedProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, GuardrailError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        next.unwrap_or_else(|| {
            Ok(CompletionResponse {
                output: String::new(),
                input_units: 0,
                output_units: 0,
            })
        })
    }
}

/// Streaming sink that keeps every frame written to it, or fails on demand
#[derive(Debug, Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<Frame>>,
    broken: std::sync::atomic::AtomicBool,
}

impl RecordingSink {
    pub fn broken() -> Self {
        let sink = Self::default();
        sink.break_now();
        sink
    }

    pub fn break_now(&self) {
        self.broken.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl StreamSink for RecordingSink {
    fn write(&self, frame: &Frame) -> Result<(), SinkError> {
        if self.broken.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(frame.clone());
        Ok(())
    }
}
