//! Job handlers and the closed registry that maps `(agent, job type)` to them.
//!
//! The registry is built once at startup. Structural mistakes such as a
//! handler for an agent nobody declared, or a declared job type with no
//! handler, fail `build()` instead of surfacing as runtime job failures.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::config::AgentSettings;
use crate::error::{JobError, RegistryError};
use crate::events::{EmitReport, EventBus};
use crate::guardrail::{CostedCall, CostedCallOutcome, GuardrailExecutor};
use crate::model::{Job, Usage};

/// Job type every agent answers to without registration; echoes its payload.
pub const PING_JOB_TYPE: &str = "ping";

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value, JobError>;
}

/// Adapts an async closure into a [`JobHandler`]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, JobError>> + Send,
{
    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value, JobError> {
        (self.0)(ctx).await
    }
}

struct PingHandler;

#[async_trait]
impl JobHandler for PingHandler {
    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value, JobError> {
        Ok(serde_json::json!({ "pong": ctx.payload().clone() }))
    }
}

/// Parameters of a costed call made from inside a handler.
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub system: String,
    pub input: String,
    pub model: Option<String>,
    pub max_output: u32,
    pub temperature: f32,
}

impl CallSpec {
    pub fn new(system: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            input: input.into(),
            model: None,
            max_output: 1024,
            temperature: 0.7,
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn max_output(mut self, max_output: u32) -> Self {
        self.max_output = max_output;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// What a handler sees of the system while running one attempt.
///
/// Costed calls made through the context are attributed to the job and
/// summed into the attempt's usage.
#[derive(Clone)]
pub struct JobContext {
    job: Arc<Job>,
    executor: Arc<GuardrailExecutor>,
    events: Arc<EventBus>,
    usage: Arc<Mutex<Usage>>,
}

impl JobContext {
    pub fn new(job: Job, executor: Arc<GuardrailExecutor>, events: Arc<EventBus>) -> Self {
        Self {
            job: Arc::new(job),
            executor,
            events,
            usage: Arc::new(Mutex::new(Usage::default())),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn agent(&self) -> &str {
        &self.job.queue
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.job.payload.clone())
            .map_err(|e| JobError::InvalidPayload(e.to_string()))
    }

    pub async fn call(&self, spec: CallSpec) -> Result<CostedCallOutcome, JobError> {
        let outcome = self
            .executor
            .call(CostedCall {
                system: spec.system,
                input: spec.input,
                model: spec.model,
                max_output: spec.max_output,
                temperature: spec.temperature,
                agent: self.job.queue.clone(),
                job_type: self.job.job_type.clone(),
            })
            .await?;

        self.usage
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add(&Usage {
                input_units: outcome.input_units,
                output_units: outcome.output_units,
                cost_usd: outcome.cost_usd,
            });
        Ok(outcome)
    }

    /// Publish a domain event caused by this job, one level deeper than the job.
    pub async fn emit(&self, name: &str, data: serde_json::Value) -> EmitReport {
        self.events
            .emit_with_depth(name, data, self.job.depth + 1)
            .await
    }

    pub fn usage(&self) -> Usage {
        *self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct AgentEntry {
    settings: AgentSettings,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

pub struct HandlerRegistry {
    agents: BTreeMap<String, AgentEntry>,
}

impl HandlerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn contains_agent(&self, agent: &str) -> bool {
        self.agents.contains_key(agent)
    }

    pub fn agents(&self) -> impl Iterator<Item = (&str, &AgentSettings)> {
        self.agents
            .iter()
            .map(|(name, entry)| (name.as_str(), &entry.settings))
    }

    pub fn settings(&self, agent: &str) -> Option<&AgentSettings> {
        self.agents.get(agent).map(|entry| &entry.settings)
    }

    pub fn critical_agents(&self) -> HashSet<String> {
        self.agents
            .iter()
            .filter(|(_, entry)| entry.settings.critical)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn job_types(&self, agent: &str) -> Vec<String> {
        let mut types: Vec<String> = self
            .agents
            .get(agent)
            .map(|entry| entry.handlers.keys().cloned().collect())
            .unwrap_or_default();
        types.sort();
        types
    }

    /// Look up the handler for one job. An unknown job type is a job failure,
    /// not a dispatch failure, so it goes through the normal retry path.
    pub fn resolve(&self, agent: &str, job_type: &str) -> Result<Arc<dyn JobHandler>, JobError> {
        self.agents
            .get(agent)
            .and_then(|entry| entry.handlers.get(job_type))
            .cloned()
            .ok_or_else(|| JobError::UnknownJobType {
                agent: agent.to_string(),
                job_type: job_type.to_string(),
            })
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    agents: Vec<(String, AgentSettings)>,
    handlers: Vec<(String, String, Arc<dyn JobHandler>)>,
}

impl RegistryBuilder {
    pub fn agent(mut self, name: impl Into<String>, settings: AgentSettings) -> Self {
        self.agents.push((name.into(), settings));
        self
    }

    /// Declare every agent from configuration.
    pub fn agents<'a, I>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a AgentSettings)>,
    {
        for (name, settings) in agents {
            self.agents.push((name.clone(), settings.clone()));
        }
        self
    }

    pub fn handler(
        mut self,
        agent: impl Into<String>,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        self.handlers.push((agent.into(), job_type.into(), handler));
        self
    }

    pub fn handler_fn<F, Fut>(self, agent: impl Into<String>, job_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, JobError>> + Send + 'static,
    {
        self.handler(agent, job_type, Arc::new(FnHandler(f)))
    }

    pub fn build(self) -> Result<HandlerRegistry, RegistryError> {
        let mut agents: BTreeMap<String, AgentEntry> = BTreeMap::new();
        for (name, settings) in self.agents {
            if settings.concurrency == 0 {
                return Err(RegistryError::ZeroConcurrency(name));
            }
            if agents.contains_key(&name) {
                return Err(RegistryError::DuplicateAgent(name));
            }
            agents.insert(
                name,
                AgentEntry {
                    settings,
                    handlers: HashMap::new(),
                },
            );
        }

        for (agent, job_type, handler) in self.handlers {
            let Some(entry) = agents.get_mut(&agent) else {
                return Err(RegistryError::UndeclaredAgent(agent));
            };
            if entry.handlers.insert(job_type.clone(), handler).is_some() {
                return Err(RegistryError::DuplicateHandler { agent, job_type });
            }
        }

        for (name, entry) in agents.iter_mut() {
            if let Some(missing) = entry
                .settings
                .job_types
                .iter()
                .find(|job_type| !entry.handlers.contains_key(*job_type))
            {
                return Err(RegistryError::MissingHandler {
                    agent: name.clone(),
                    job_type: missing.clone(),
                });
            }
            entry
                .handlers
                .entry(PING_JOB_TYPE.to_string())
                .or_insert_with(|| Arc::new(PingHandler));
        }

        Ok(HandlerRegistry { agents })
    }
}
