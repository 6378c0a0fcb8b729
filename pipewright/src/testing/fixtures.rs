//! A scratch environment for running pipelines in tests.

use crate::definition::{load, LoadedPipeline, PipelineSource, Variables};
use crate::events::CollectingEventSink;
use crate::orchestrator::Orchestrator;
use crate::worker::{ProcessorRegistry, Services};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Temporary manifest directory, shared services and an event collector.
pub struct TestFixture {
    dir: TempDir,
    /// Services handed to every orchestrator built by the fixture.
    pub services: Services,
    /// Collects every event emitted by those orchestrators.
    pub events: Arc<CollectingEventSink>,
}

impl TestFixture {
    /// Creates a fixture with in-memory services.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp dir"),
            services: Services::default(),
            events: Arc::new(CollectingEventSink::new()),
        }
    }

    /// Replaces the services.
    #[must_use]
    pub fn with_services(mut self, services: Services) -> Self {
        self.services = services;
        self
    }

    /// The temporary directory; manifests land here.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// An orchestrator wired to the fixture.
    #[must_use]
    pub fn orchestrator(&self, registry: ProcessorRegistry) -> Orchestrator {
        Orchestrator::new(registry)
            .with_manifest_dir(self.dir.path())
            .with_services(self.services.clone())
            .with_event_sink(self.events.clone())
    }

    /// Loads a YAML pipeline with no variables.
    ///
    /// # Panics
    ///
    /// Panics if the pipeline does not load.
    #[must_use]
    pub fn pipeline(&self, yaml: &str) -> LoadedPipeline {
        load(&PipelineSource::Yaml(yaml.to_string()), &Variables::new()).expect("pipeline loads")
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_builds_pipeline() {
        let fixture = TestFixture::new();
        let pipeline = fixture.pipeline(
            "name: demo\nstages:\n  - id: a\n    agent: echo\n  - id: b\n    agent: echo\n    depends_on: [a]\n",
        );
        assert_eq!(pipeline.plan.stage_count(), 2);
        assert!(fixture.dir().exists());
        assert_eq!(fixture.events.len(), 0);
    }
}
