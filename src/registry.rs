// src/registry.rs
//! Job name to handler lookup. Typed jobs get their payload decoded into the
//! registered type; closure handlers see the raw JSON.

use crate::{Job, JobContext, RelayError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;

#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed job under `T::name()`. A later registration with the
    /// same name replaces the earlier one.
    pub fn register<T: Job>(&mut self) -> &mut Self {
        self.handlers
            .insert(T::name().to_string(), Box::new(Typed::<T>(PhantomData)));
        self
    }

    /// Register a handler working on the raw payload.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handlers.insert(name.into(), Box::new(FnHandler(handler)));
        self
    }

    /// Run the handler registered for `name`. An unknown name is an error
    /// like any other handler failure.
    pub async fn execute_job(
        &self,
        name: &str,
        payload: serde_json::Value,
        ctx: &JobContext,
    ) -> Result<()> {
        let handler = self.handlers.get(name).ok_or_else(|| {
            RelayError::Registry(format!("no handler registered for job '{}'", name))
        })?;

        handler.handle(payload, ctx).await
    }

    /// Registered names, sorted.
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains_job(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

#[async_trait::async_trait]
trait Handler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value, ctx: &JobContext) -> Result<()>;
}

struct Typed<T>(PhantomData<fn() -> T>);

#[async_trait::async_trait]
impl<T: Job> Handler for Typed<T> {
    async fn handle(&self, payload: serde_json::Value, ctx: &JobContext) -> Result<()> {
        let job: T = serde_json::from_value(payload)?;
        job.perform(ctx).await
    }
}

struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, payload: serde_json::Value, ctx: &JobContext) -> Result<()> {
        (self.0)(payload, ctx.clone()).await
    }
}
