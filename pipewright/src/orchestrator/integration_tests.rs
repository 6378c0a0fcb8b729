//! End-to-end runs through loader, queues, workers and manifest.

#[cfg(test)]
mod tests {
    use crate::core::{AgentOutput, RunStatus, StageStatus};
    use crate::errors::{AgentError, EngineError};
    use crate::events::names;
    use crate::limits::{Budgets, RateLimiter, ServiceLimits};
    use crate::manifest;
    use crate::orchestrator::{ArticleState, RunRequest, StateMachine};
    use crate::testing::{
        assert_ran_before, assert_run_failed, assert_run_succeeded, assert_stage_status,
        FailingProcessor, FlakyProcessor, RecordingProcessor, TestFixture,
    };
    use crate::worker::{FnProcessor, ProcessorContext, ProcessorRegistry, Services};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    const DIAMOND: &str = r"
name: diamond
settings:
  parallel:
    default: 2
stages:
  - id: plan
    agent: planner
  - id: research
    agent: worker
    dependsOn: [plan]
  - id: outline
    agent: worker
    dependsOn: [plan]
  - id: write
    agent: writer
    dependsOn: [research, outline]
";

    #[tokio::test]
    async fn test_levels_run_in_dependency_order() {
        let fixture = TestFixture::new();
        let planner = RecordingProcessor::new();
        let worker = RecordingProcessor::new();
        let writer = RecordingProcessor::new();
        let registry = ProcessorRegistry::new()
            .with("planner", planner.clone())
            .with("worker", worker.clone())
            .with("writer", writer.clone());

        let result = fixture
            .orchestrator(registry)
            .run(&fixture.pipeline(DIAMOND), RunRequest::new("rust").with_run_id("d1"))
            .await
            .unwrap();

        assert_run_succeeded(&result);
        assert_ran_before(&planner.calls(), &worker.calls());
        assert_ran_before(&worker.calls(), &writer.calls());
        assert_eq!(result.manifest.steps.first().map(String::as_str), Some("plan"));
        assert_eq!(result.manifest.steps.last().map(String::as_str), Some("write"));
        assert_eq!(result.manifest.steps.len(), 4);

        let on_disk = manifest::load(&result.manifest_path).await.unwrap();
        assert_eq!(on_disk.status, RunStatus::Succeeded);
        assert!(on_disk.is_final);
        assert_eq!(fixture.events.count(names::RUN_COMPLETED), 1);
    }

    #[tokio::test]
    async fn test_level_is_a_barrier_and_runs_in_parallel() {
        let fixture = TestFixture::new();
        let slow = RecordingProcessor::new().with_delay(Duration::from_millis(40));
        let after = RecordingProcessor::new();
        let registry = ProcessorRegistry::new()
            .with("slow", slow.clone())
            .with("after", after.clone());
        let pipeline = fixture.pipeline(
            r"
name: fan
settings:
  parallel:
    default: 3
stages:
  - { id: a, agent: slow }
  - { id: b, agent: slow }
  - { id: c, agent: slow }
  - { id: join, agent: after, dependsOn: [a, b, c] }
",
        );

        let result = fixture
            .orchestrator(registry)
            .run(&pipeline, RunRequest::new("rust"))
            .await
            .unwrap();

        assert_run_succeeded(&result);
        assert_eq!(slow.max_concurrency(), 3);
        assert_ran_before(&slow.calls(), &after.calls());
    }

    const THREE_WIDE: &str = r"
name: fan
settings:
  parallel:
    default: 1
stages:
  - { id: a, agent: slow }
  - { id: b, agent: slow }
  - { id: c, agent: slow }
";

    #[tokio::test]
    async fn test_parallel_setting_of_one_serializes_a_level() {
        let fixture = TestFixture::new();
        let slow = RecordingProcessor::new().with_delay(Duration::from_millis(20));

        let result = fixture
            .orchestrator(ProcessorRegistry::new().with("slow", slow.clone()))
            .run(&fixture.pipeline(THREE_WIDE), RunRequest::new("rust"))
            .await
            .unwrap();

        assert_run_succeeded(&result);
        assert_eq!(slow.call_count(), 3);
        assert_eq!(slow.max_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_parallel_override_widens_and_narrows_queues() {
        let fixture = TestFixture::new();
        let pipeline = fixture.pipeline(THREE_WIDE);

        let widened = RecordingProcessor::new().with_delay(Duration::from_millis(40));
        fixture
            .orchestrator(ProcessorRegistry::new().with("slow", widened.clone()))
            .run(&pipeline, RunRequest::new("rust").with_parallel(3))
            .await
            .unwrap();
        assert_eq!(widened.max_concurrency(), 3);

        let partial = RecordingProcessor::new().with_delay(Duration::from_millis(40));
        fixture
            .orchestrator(ProcessorRegistry::new().with("slow", partial.clone()))
            .run(&pipeline, RunRequest::new("rust").with_parallel(2))
            .await
            .unwrap();
        assert_eq!(partial.max_concurrency(), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let fixture = TestFixture::new();
        let failing = FailingProcessor::new("upstream 503");
        let downstream = RecordingProcessor::new();
        let pipeline = fixture.pipeline(
            r"
name: retry
settings:
  retries: 2
  backoff: { base_delay_ms: 1, max_delay_ms: 5 }
stages:
  - { id: fetch, agent: fetcher }
  - { id: use, agent: user, dependsOn: [fetch] }
",
        );
        let registry = ProcessorRegistry::new()
            .with("fetcher", failing.clone())
            .with("user", downstream.clone());

        let result = fixture
            .orchestrator(registry)
            .run(&pipeline, RunRequest::new("rust"))
            .await
            .unwrap();

        assert_run_failed(&result);
        assert_eq!(failing.calls(), 3);
        assert_eq!(downstream.call_count(), 0);
        assert_stage_status(&result, "fetch", StageStatus::Failed);
        let attempts: Vec<u32> = result.manifest.errors_for("fetch").map(|e| e.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(
            result.manifest.halted_by.as_ref().and_then(|h| h.stage.as_deref()),
            Some("fetch")
        );
    }

    #[tokio::test]
    async fn test_flaky_stage_recovers_within_budget() {
        let fixture = TestFixture::new();
        let flaky = FlakyProcessor::new(1);
        let pipeline = fixture.pipeline(
            r"
name: flaky
settings:
  backoff: { base_delay_ms: 1, max_delay_ms: 5 }
stages:
  - { id: fetch, agent: fetcher, retries: 1 }
",
        );

        let result = fixture
            .orchestrator(ProcessorRegistry::new().with("fetcher", flaky.clone()))
            .run(&pipeline, RunRequest::new("rust"))
            .await
            .unwrap();

        assert_run_succeeded(&result);
        assert_eq!(flaky.calls(), 2);
        assert_eq!(result.stage("fetch").unwrap().attempts, 2);
        assert_eq!(result.manifest.errors_for("fetch").count(), 1);
    }

    #[tokio::test]
    async fn test_second_run_is_served_from_cache() {
        let fixture = TestFixture::new();
        let planner = RecordingProcessor::new();
        let writer = RecordingProcessor::new();
        let registry = ProcessorRegistry::new()
            .with("planner", planner.clone())
            .with("writer", writer.clone());
        let pipeline = fixture.pipeline(
            r"
name: cached
stages:
  - { id: plan, agent: planner, cache: true }
  - { id: write, agent: writer, dependsOn: [plan] }
",
        );
        let orchestrator = fixture.orchestrator(registry);

        let first = orchestrator
            .run(&pipeline, RunRequest::new("rust").with_run_id("c1"))
            .await
            .unwrap();
        let second = orchestrator
            .run(&pipeline, RunRequest::new("rust").with_run_id("c2"))
            .await
            .unwrap();

        assert_stage_status(&first, "plan", StageStatus::Completed);
        assert_stage_status(&second, "plan", StageStatus::Cached);
        assert_eq!(planner.call_count(), 1);
        assert_eq!(writer.call_count(), 2);
        assert!(second.manifest.has_step("plan"));
        assert_eq!(fixture.events.count(names::STAGE_CACHED), 1);
        assert_eq!(
            first.stage("plan").unwrap().output,
            second.stage("plan").unwrap().output
        );

        let third = orchestrator
            .run(&pipeline, RunRequest::new("rust").without_cache())
            .await
            .unwrap();
        assert_stage_status(&third, "plan", StageStatus::Completed);
        assert_eq!(planner.call_count(), 2);
    }

    #[tokio::test]
    async fn test_foreach_fans_out_one_job_per_item() {
        let fixture = TestFixture::new();
        let planner = RecordingProcessor::new()
            .with_output(AgentOutput::ok_value("chapters", json!(["intro", "body", "outro"])));
        let translator = RecordingProcessor::new();
        let registry = ProcessorRegistry::new()
            .with("planner", planner)
            .with("translator", translator.clone());
        let pipeline = fixture.pipeline(
            r"
name: book
settings:
  parallel:
    default: 2
stages:
  - { id: plan, agent: planner }
  - id: translate
    agent: translator
    dependsOn: [plan]
    foreach: stages.plan.output.chapters
",
        );

        let result = fixture
            .orchestrator(registry)
            .run(&pipeline, RunRequest::new("rust"))
            .await
            .unwrap();

        assert_run_succeeded(&result);
        let mut items: Vec<String> = translator
            .calls()
            .iter()
            .map(|c| c.payload["item"].as_str().unwrap_or_default().to_string())
            .collect();
        items.sort();
        assert_eq!(items, vec!["body", "intro", "outro"]);

        let outcome = result.stage("translate").unwrap();
        assert_eq!(outcome.jobs, 3);
        let output = outcome.output.as_ref().unwrap();
        assert_eq!(output.get("items").and_then(|v| v.as_array()).map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn test_optional_failure_lets_run_continue() {
        let fixture = TestFixture::new();
        let after = RecordingProcessor::new();
        let pipeline = fixture.pipeline(
            r"
name: optional
stages:
  - { id: illustrate, agent: painter, required: false, retries: 0 }
  - { id: format, agent: formatter, dependsOn: [illustrate] }
",
        );
        let registry = ProcessorRegistry::new()
            .with("painter", FailingProcessor::new("no gpu").permanent())
            .with("formatter", after.clone());

        let result = fixture
            .orchestrator(registry)
            .run(&pipeline, RunRequest::new("rust"))
            .await
            .unwrap();

        assert_run_succeeded(&result);
        assert_stage_status(&result, "illustrate", StageStatus::Failed);
        assert_stage_status(&result, "format", StageStatus::Completed);
        assert_eq!(after.call_count(), 1);
        assert_eq!(result.manifest.errors_for("illustrate").count(), 1);
        assert_eq!(fixture.events.count(names::STAGE_FAILED), 1);
    }

    #[tokio::test]
    async fn test_condition_skips_stage() {
        let fixture = TestFixture::new();
        let translator = RecordingProcessor::new();
        let pipeline = fixture.pipeline(
            r"
name: cond
stages:
  - id: translate
    agent: translator
    condition: vars.language != 'en'
",
        );

        let result = fixture
            .orchestrator(ProcessorRegistry::new().with("translator", translator.clone()))
            .run(&pipeline, RunRequest::new("rust").with_variable("language", json!("en")))
            .await
            .unwrap();

        assert_run_succeeded(&result);
        assert_stage_status(&result, "translate", StageStatus::Skipped);
        assert_eq!(result.manifest.skipped, vec!["translate"]);
        assert_eq!(translator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_budget_exceeded_aborts_before_next_level() {
        let fixture = TestFixture::new();
        let spender = FnProcessor::new(|_payload: Value, ctx: ProcessorContext| async move {
            ctx.services
                .cost_tracker
                .record_spend(5.0, "llm")
                .map_err(|e| AgentError::permanent(e.to_string()))?;
            Ok::<_, AgentError>(AgentOutput::ok())
        });
        let later = RecordingProcessor::new();
        let pipeline = fixture.pipeline(
            r"
name: spendy
stages:
  - { id: draft, agent: spender }
  - { id: polish, agent: later, dependsOn: [draft] }
",
        );
        let orchestrator = fixture
            .orchestrator(
                ProcessorRegistry::new()
                    .with("spender", spender)
                    .with("later", later.clone()),
            )
            .with_budgets(Budgets::default().with_per_run(1.0));

        let err = orchestrator
            .run(&pipeline, RunRequest::new("rust").with_run_id("b1"))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::BudgetExceeded(_)));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(later.call_count(), 0);
        let on_disk = manifest::load(&manifest::manifest_path(fixture.dir(), "b1"))
            .await
            .unwrap();
        assert_eq!(on_disk.status, RunStatus::Aborted);
        assert!(on_disk.has_step("draft"));
        assert!(!on_disk.is_final);
    }

    #[tokio::test]
    async fn test_quota_abort_lets_dispatched_stages_finish() {
        let limiter = RateLimiter::new();
        limiter.set_limits("search", ServiceLimits::default().per_minute(1));
        limiter.record_call("search");
        let fixture = TestFixture::new()
            .with_services(Services::default().with_rate_limiter(Arc::new(limiter)));
        let slow = RecordingProcessor::new().with_delay(Duration::from_millis(30));
        let searcher = RecordingProcessor::new();
        let pipeline = fixture.pipeline(
            r"
name: quota
settings:
  quota_max_wait_ms: 0
  parallel:
    default: 2
stages:
  - { id: a, agent: slow }
  - { id: b, agent: searcher, service: search }
",
        );

        let err = fixture
            .orchestrator(
                ProcessorRegistry::new()
                    .with("slow", slow.clone())
                    .with("searcher", searcher.clone()),
            )
            .run(&pipeline, RunRequest::new("rust").with_run_id("q1"))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::QuotaExceeded(_)));
        assert_eq!(slow.call_count(), 1);
        assert_eq!(searcher.call_count(), 0);
        let on_disk = manifest::load(&manifest::manifest_path(fixture.dir(), "q1"))
            .await
            .unwrap();
        assert_eq!(on_disk.status, RunStatus::Aborted);
        assert_eq!(on_disk.stage_status("a"), StageStatus::Completed);
        assert_eq!(on_disk.steps, vec!["a"]);
        assert_eq!(on_disk.stage_status("b"), StageStatus::Pending);
    }

    #[tokio::test]
    async fn test_notifications_fire_on_run_events() {
        let fixture = TestFixture::new();
        let pipeline = fixture.pipeline(
            r"
name: notify
stages:
  - { id: a, agent: echo }
notifications:
  run.completed:
    - type: log
      message: '{{pipeline}} finished for {{topic}}'
    - type: emit
",
        );

        fixture
            .orchestrator(ProcessorRegistry::new().with("echo", RecordingProcessor::new()))
            .run(&pipeline, RunRequest::new("rust"))
            .await
            .unwrap();

        let notes = fixture.events.events_of_type("notification.run.completed");
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].1.as_ref().unwrap()["topic"], json!("rust"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_machine_retries_then_resumes() {
        let fixture = TestFixture::new();
        let path = fixture.dir().join("article.json");
        let broken = FailingProcessor::new("fact source unreachable");
        let mut registry = ProcessorRegistry::new();
        for state in ArticleState::ALL {
            if let Some(agent) = state.default_agent() {
                registry.register(agent, RecordingProcessor::new());
            }
        }

        let failed = StateMachine::new(registry.clone().with("fact_checker", broken.clone()))
            .with_max_attempts(2)
            .run(&RunRequest::new("rust").with_manifest_path(&path))
            .await
            .unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(broken.calls(), 2);
        assert_eq!(failed.manifest.errors_for("fact_checker").count(), 2);

        let summary = manifest::check_status(&path).await.unwrap();
        assert_eq!(summary.halting_stage(), Some("fact_checker"));

        let resumed = StateMachine::new(registry)
            .resume(&path, &RunRequest::new("rust"))
            .await
            .unwrap();
        assert_run_succeeded(&resumed);
        assert!(resumed.manifest.is_final);
        assert_eq!(resumed.manifest.steps.len(), 9);
        assert_eq!(resumed.manifest.errors.len(), 2);
    }
}
