//! Name → processor map, populated at startup.

use super::processor::StageProcessor;
use std::collections::HashMap;
use std::sync::Arc;

/// Registered stage processors keyed by agent name.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn StageProcessor>>,
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("agents", &self.names())
            .finish()
    }
}

impl ProcessorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a processor, replacing any previous one of that name.
    pub fn register(&mut self, agent: impl Into<String>, processor: impl StageProcessor + 'static) {
        self.register_arc(agent, Arc::new(processor));
    }

    /// Registers a shared processor.
    pub fn register_arc(&mut self, agent: impl Into<String>, processor: Arc<dyn StageProcessor>) {
        self.processors.insert(agent.into(), processor);
    }

    /// Builder form of [`ProcessorRegistry::register`].
    #[must_use]
    pub fn with(mut self, agent: impl Into<String>, processor: impl StageProcessor + 'static) -> Self {
        self.register(agent, processor);
        self
    }

    /// Looks up a processor.
    #[must_use]
    pub fn get(&self, agent: &str) -> Option<Arc<dyn StageProcessor>> {
        self.processors.get(agent).cloned()
    }

    /// Returns true if `agent` is registered.
    #[must_use]
    pub fn contains(&self, agent: &str) -> bool {
        self.processors.contains_key(agent)
    }

    /// Registered agent names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered processors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::demo::{EchoProcessor, FailProcessor};

    #[test]
    fn test_register_and_lookup() {
        let registry = ProcessorRegistry::new()
            .with("echo", EchoProcessor)
            .with("fail", FailProcessor::default());

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("echo"));
        assert!(registry.get("fail").is_some());
        assert!(registry.get("research").is_none());
        assert_eq!(registry.names(), vec!["echo", "fail"]);
    }
}
