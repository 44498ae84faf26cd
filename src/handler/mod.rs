//! Task handlers and the registry that dispatches to them.
//!
//! A handler performs the actual generation work for one task kind and
//! persists whatever it produces. The queue only records whether it
//! returned normally.

pub mod command;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::TaskKind;

pub use command::{CommandHandler, load_from_dir};

/// Executes the work for one task.
///
/// An `Err` marks the task failed; its display (with causes) becomes the
/// task's `error_message`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> anyhow::Result<()>;
}

/// Handlers for every task kind.
///
/// Only obtainable through [`HandlerRegistryBuilder::build`], which refuses
/// to produce a registry with a kind left unhandled.
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Look up the handler for a kind.
    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistryBuilder {
    /// Register the handler for a kind. Each kind may be registered once.
    pub fn register<H>(mut self, kind: TaskKind, handler: H) -> Result<Self>
    where
        H: TaskHandler + 'static,
    {
        self.insert(kind, Arc::new(handler))?;
        Ok(self)
    }

    pub(crate) fn insert(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Result<()> {
        if self.handlers.contains_key(&kind) {
            return Err(Error::DuplicateHandler(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    /// Kinds that still lack a handler.
    pub fn missing(&self) -> Vec<TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(|kind| !self.handlers.contains_key(kind))
            .collect()
    }

    /// Finish the registry. Fails on the first kind without a handler.
    pub fn build(self) -> Result<HandlerRegistry> {
        if let Some(kind) = self.missing().into_iter().next() {
            return Err(Error::MissingHandler(kind));
        }
        Ok(HandlerRegistry {
            handlers: self.handlers,
        })
    }
}
