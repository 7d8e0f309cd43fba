//! Handler trait and dispatch registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::envelope::JobEnvelope;

/// Trait for the business handler invoked per job.
///
/// The handler type doubles as the typed view of the envelope's open payload
/// map: it is deserialized from `payload` before `run` is invoked, so each
/// job type validates its own payload shape and the envelope layer stays
/// duck-type free.
pub trait JobHandler: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Dispatch key for this handler.
    ///
    /// This MUST be unique for the whole application.
    const JOB_TYPE: &'static str;

    /// The application data provided to this handler at runtime.
    type Context: Clone + Send + 'static;

    /// Execute the job. Errors are retried with backoff until the message's
    /// attempt budget is exhausted; panics are caught and treated the same.
    fn run(
        &self,
        envelope: &JobEnvelope,
        ctx: Self::Context,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Serialize this handler's data into an envelope payload map.
    fn payload(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(serde::ser::Error::custom(
                "job payload must serialize to a JSON object",
            )),
        }
    }
}

type RunTaskFn<Context> =
    Arc<dyn Fn(Context, JobEnvelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Maps job types to their registered handlers.
pub struct HandlerRegistry<Context> {
    handlers: HashMap<String, RunTaskFn<Context>>,
}

impl<Context> Default for HandlerRegistry<Context> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<Context> Clone for HandlerRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<Context: Clone + Send + 'static> HandlerRegistry<Context> {
    /// Register a handler type under its [`JobHandler::JOB_TYPE`].
    pub fn register<H: JobHandler<Context = Context>>(&mut self) {
        let run: RunTaskFn<Context> = Arc::new(|ctx, envelope| {
            async move {
                let job: H = serde_json::from_value(Value::Object(envelope.payload.clone()))
                    .with_context(|| {
                        format!("invalid payload for job type `{}`", H::JOB_TYPE)
                    })?;
                job.run(&envelope, ctx).await
            }
            .boxed()
        });
        self.handlers.insert(H::JOB_TYPE.to_owned(), run);
    }

    /// The job types this registry can dispatch, for claim filtering.
    pub fn job_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Look up the run function for a job type.
    pub(crate) fn get(&self, job_type: &str) -> Option<RunTaskFn<Context>> {
        self.handlers.get(job_type).cloned()
    }
}

impl<Context> std::fmt::Debug for HandlerRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
