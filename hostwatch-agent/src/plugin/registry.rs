use super::{BuildContext, Check};
use crate::config::TaskSpec;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub type CheckFactory =
    Arc<dyn Fn(&TaskSpec, &BuildContext) -> anyhow::Result<Box<dyn Check>> + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no plugin registered for module '{0}'")]
    UnknownModule(String),
}

/// Explicit module name to check factory mapping, populated at startup.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, CheckFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `module`, replacing any previous entry.
    pub fn register<F>(&mut self, module: &str, factory: F) -> &mut Self
    where
        F: Fn(&TaskSpec, &BuildContext) -> anyhow::Result<Box<dyn Check>> + Send + Sync + 'static,
    {
        self.factories.insert(module.to_string(), Arc::new(factory));
        self
    }

    /// Looks up `module`, falling back to its last dotted segment
    /// (`monitor.serverloads` resolves `serverloads`).
    pub fn resolve(&self, module: &str) -> Result<CheckFactory, RegistryError> {
        if let Some(factory) = self.factories.get(module) {
            return Ok(factory.clone());
        }
        module
            .rsplit('.')
            .next()
            .and_then(|short| self.factories.get(short))
            .cloned()
            .ok_or_else(|| RegistryError::UnknownModule(module.to_string()))
    }

    pub fn contains(&self, module: &str) -> bool {
        self.resolve(module).is_ok()
    }

    pub fn modules(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("modules", &self.modules())
            .finish()
    }
}
