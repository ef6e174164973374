//! Hook handlers.
//!
//! A handler is the code that runs when an action for its hook executes.
//! Handlers are registered by hook name before any worker starts; the runner
//! looks them up by the action's `hook` at execution time.

mod shell;

pub use self::shell::ShellHandler;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::action::validate_hook_name;
use crate::config::HookConfig;
use crate::error::{HookqError, Result};

// ---------------------------------------------------------------------------
// CancelFlag
// ---------------------------------------------------------------------------

/// Raised by the runner when a handler exceeds its execution budget.
/// Handlers that can stop early should watch it.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    raised: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is raised.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// HandlerContext / HandlerError
// ---------------------------------------------------------------------------

/// Everything a handler receives for one execution.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub action_id: Uuid,
    pub hook: String,
    pub args: Vec<Value>,
    /// 1-indexed attempt number of this execution.
    pub attempt: u32,
    pub group: Option<String>,
    pub cancel: CancelFlag,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub type HandlerFuture = BoxFuture<'static, std::result::Result<Value, HandlerError>>;

pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: HandlerContext) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
{
    fn call(&self, ctx: HandlerContext) -> HandlerFuture {
        Box::pin(self(ctx))
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn Handler>,
    budget: Option<Duration>,
}

/// Hook name to handler map. Built once, then shared read-only by runners.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: impl Into<String>, handler: impl Handler) -> Result<()> {
        self.insert(hook.into(), Arc::new(handler), None)
    }

    /// Register with an execution budget that overrides the worker default.
    pub fn register_with_budget(
        &mut self,
        hook: impl Into<String>,
        handler: impl Handler,
        budget: Duration,
    ) -> Result<()> {
        self.insert(hook.into(), Arc::new(handler), Some(budget))
    }

    fn insert(&mut self, hook: String, handler: Arc<dyn Handler>, budget: Option<Duration>) -> Result<()> {
        validate_hook_name(&hook)?;
        if self.handlers.contains_key(&hook) {
            return Err(HookqError::HandlerExists(hook));
        }
        tracing::debug!(%hook, "registered handler");
        self.handlers.insert(hook, Registration { handler, budget });
        Ok(())
    }

    /// Build a registry of shell handlers from configured hooks.
    pub fn from_hooks(hooks: &BTreeMap<String, HookConfig>, root: &Path) -> Result<Self> {
        let mut registry = Self::new();
        for (name, hook) in hooks {
            let handler = ShellHandler::new(&hook.command, hook.args.clone(), root)?;
            match hook.timeout_secs {
                Some(secs) => {
                    registry.register_with_budget(name.clone(), handler, Duration::from_secs(secs))?
                }
                None => registry.register(name.clone(), handler)?,
            }
        }
        Ok(registry)
    }

    pub fn get(&self, hook: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(hook).map(|r| Arc::clone(&r.handler))
    }

    pub fn budget(&self, hook: &str) -> Option<Duration> {
        self.handlers.get(hook).and_then(|r| r.budget)
    }

    pub fn contains(&self, hook: &str) -> bool {
        self.handlers.contains_key(hook)
    }

    /// Registered hook names, sorted.
    pub fn hooks(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
