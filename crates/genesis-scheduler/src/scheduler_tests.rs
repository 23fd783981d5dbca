//! End-to-end scheduler scenarios driven against a scripted in-memory
//! engine.

use crate::dag::{DagBuilder, DEFAULT_ROOT_IMAGE};
use crate::machine;
use crate::Scheduler;
use async_trait::async_trait;
use genesis_core::pipeline::{Pipeline, StepDefinition};
use genesis_core::ports::{ContainerEngine, ContainerObservation, ContainerSpec};
use genesis_core::run::{RunReport, StepState};
use genesis_core::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted engine. Containers are keyed by image, which the tests keep
/// unique per step, and every call is recorded as an `op:image` event.
#[derive(Default)]
struct MockEngine {
    exit_codes: HashMap<String, i64>,
    create_failures: Vec<String>,
    start_failures: Vec<String>,
    inner: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    inspect_failures: HashMap<String, u32>,
    events: Vec<String>,
}

struct MockContainer {
    spec: ContainerSpec,
    started: bool,
    removed: bool,
}

impl MockEngine {
    fn new() -> Self {
        Self::default()
    }

    fn exit_code(mut self, image: &str, code: i64) -> Self {
        self.exit_codes.insert(image.to_string(), code);
        self
    }

    fn fail_create(mut self, image: &str) -> Self {
        self.create_failures.push(image.to_string());
        self
    }

    fn fail_start(mut self, image: &str) -> Self {
        self.start_failures.push(image.to_string());
        self
    }

    fn fail_inspect(self, image: &str, times: u32) -> Self {
        self.inner
            .lock()
            .unwrap()
            .inspect_failures
            .insert(image.to_string(), times);
        self
    }

    fn events(&self) -> Vec<String> {
        self.inner.lock().unwrap().events.clone()
    }

    fn all_removed(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .containers
            .values()
            .all(|c| c.removed)
    }

    fn created_images(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .values()
            .map(|c| c.spec.image.clone())
            .collect()
    }

    fn spec_of(&self, image: &str) -> ContainerSpec {
        self.inner
            .lock()
            .unwrap()
            .containers
            .get(&container_id(image))
            .unwrap_or_else(|| panic!("no container for image {image}"))
            .spec
            .clone()
    }
}

fn container_id(image: &str) -> String {
    format!("ctr-{image}")
}

fn image_of(container: &str) -> String {
    container.trim_start_matches("ctr-").to_string()
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        if self.create_failures.contains(&spec.image) {
            return Err(Error::Engine(format!("no such image: {}", spec.image)));
        }
        let id = container_id(&spec.image);
        let mut inner = self.inner.lock().unwrap();
        inner.events.push(format!("create:{}", spec.image));
        inner.containers.insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                started: false,
                removed: false,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let image = image_of(id);
        if self.start_failures.contains(&image) {
            return Err(Error::Engine(format!("cannot start {image}")));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.events.push(format!("start:{image}"));
        inner
            .containers
            .get_mut(id)
            .expect("start of unknown container")
            .started = true;
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerObservation> {
        let image = image_of(id);
        let mut inner = self.inner.lock().unwrap();
        if let Some(remaining) = inner.inspect_failures.get_mut(&image) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Engine("daemon hiccup".to_string()));
            }
        }
        let started = inner
            .containers
            .get(id)
            .expect("inspect of unknown container")
            .started;
        if !started {
            return Ok(ContainerObservation::Running);
        }
        // Every started container exits by its first observation.
        inner.events.push(format!("exit:{image}"));
        let exit_code = self.exit_codes.get(&image).copied().unwrap_or(0);
        Ok(ContainerObservation::Exited { exit_code })
    }

    async fn stream_logs(&self, id: &str) -> Result<()> {
        let image = image_of(id);
        self.inner
            .lock()
            .unwrap()
            .events
            .push(format!("logs:{image}"));
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let image = image_of(id);
        let mut inner = self.inner.lock().unwrap();
        inner.events.push(format!("remove:{image}"));
        inner
            .containers
            .get_mut(id)
            .expect("remove of unknown container")
            .removed = true;
        Ok(())
    }
}

/// Engine for tests that must not touch the runtime at all.
struct PanicEngine;

#[async_trait]
impl ContainerEngine for PanicEngine {
    async fn create(&self, _spec: &ContainerSpec) -> Result<String> {
        panic!("engine must not be called");
    }
    async fn start(&self, _id: &str) -> Result<()> {
        panic!("engine must not be called");
    }
    async fn inspect(&self, _id: &str) -> Result<ContainerObservation> {
        panic!("engine must not be called");
    }
    async fn stream_logs(&self, _id: &str) -> Result<()> {
        panic!("engine must not be called");
    }
    async fn remove(&self, _id: &str) -> Result<()> {
        panic!("engine must not be called");
    }
}

fn make_step(name: &str, depends_on: Vec<&str>) -> StepDefinition {
    StepDefinition {
        name: name.to_string(),
        // Image doubles as the scripting key.
        image: name.to_string(),
        command: Some("echo test".to_string()),
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        environment: Vec::new(),
        ports: Vec::new(),
    }
}

fn make_pipeline(steps: Vec<StepDefinition>) -> Pipeline {
    Pipeline {
        name: "test".to_string(),
        mount: None,
        steps,
    }
}

fn scheduler(engine: Arc<MockEngine>) -> Scheduler {
    Scheduler::new(engine).with_poll_interval(Duration::from_millis(1))
}

fn state_of(report: &RunReport, name: &str) -> StepState {
    report
        .steps
        .iter()
        .find(|s| s.name == name)
        .unwrap_or_else(|| panic!("step {name} missing from report"))
        .state
}

fn pos(events: &[String], needle: &str) -> usize {
    events
        .iter()
        .position(|e| e == needle)
        .unwrap_or_else(|| panic!("event {needle} not found in {events:?}"))
}

#[tokio::test]
async fn test_linear_chain_succeeds() {
    let engine = Arc::new(MockEngine::new());
    let pipeline = make_pipeline(vec![
        make_step("a", vec![]),
        make_step("b", vec!["a"]),
        make_step("c", vec!["b"]),
    ]);

    let report = scheduler(engine.clone()).run(&pipeline).await.unwrap();

    assert!(report.is_success());
    for name in ["root", "a", "b", "c"] {
        assert_eq!(state_of(&report, name), StepState::Succeeded);
    }
    assert!(engine.all_removed());

    // Children dispatch only after the root has been observed succeeding.
    let events = engine.events();
    assert!(pos(&events, &format!("exit:{DEFAULT_ROOT_IMAGE}")) < pos(&events, "create:a"));
    assert!(pos(&events, "exit:a") < pos(&events, "create:b"));
    assert!(pos(&events, "exit:b") < pos(&events, "create:c"));
}

#[tokio::test]
async fn test_logs_are_streamed_before_removal() {
    let engine = Arc::new(MockEngine::new());
    let pipeline = make_pipeline(vec![make_step("a", vec![])]);

    scheduler(engine.clone()).run(&pipeline).await.unwrap();

    let events = engine.events();
    assert!(pos(&events, "logs:a") < pos(&events, "remove:a"));
}

#[tokio::test]
async fn test_fan_out_gates_the_join_step() {
    let engine = Arc::new(MockEngine::new());
    let pipeline = make_pipeline(vec![
        make_step("a", vec![]),
        make_step("b", vec![]),
        make_step("c", vec!["a", "b"]),
    ]);

    let report = scheduler(engine.clone()).run(&pipeline).await.unwrap();

    assert!(report.is_success());
    let events = engine.events();
    assert!(pos(&events, "exit:a") < pos(&events, "create:c"));
    assert!(pos(&events, "exit:b") < pos(&events, "create:c"));
}

#[tokio::test]
async fn test_failure_cancels_descendants() {
    let engine = Arc::new(MockEngine::new().exit_code("a", 1));
    let pipeline = make_pipeline(vec![
        make_step("a", vec![]),
        make_step("b", vec!["a"]),
        make_step("c", vec!["b"]),
    ]);

    let report = scheduler(engine.clone()).run(&pipeline).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(state_of(&report, "a"), StepState::Failed);
    assert_eq!(state_of(&report, "b"), StepState::Cancelled);
    assert_eq!(state_of(&report, "c"), StepState::Cancelled);

    // Cancelled steps never got containers.
    let created = engine.created_images();
    assert!(!created.contains(&"b".to_string()));
    assert!(!created.contains(&"c".to_string()));
    assert!(engine.all_removed());
}

#[tokio::test]
async fn test_parallel_branch_survives_sibling_failure() {
    let engine = Arc::new(MockEngine::new().exit_code("b", 2));
    let pipeline = make_pipeline(vec![
        make_step("a", vec![]),
        make_step("b", vec![]),
        make_step("c", vec!["a"]),
    ]);

    let report = scheduler(engine.clone()).run(&pipeline).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(state_of(&report, "a"), StepState::Succeeded);
    assert_eq!(state_of(&report, "b"), StepState::Failed);
    assert_eq!(state_of(&report, "c"), StepState::Succeeded);
    assert!(engine.all_removed());
}

#[tokio::test]
async fn test_start_failure_fails_the_step_and_cancels_below() {
    let engine = Arc::new(MockEngine::new().fail_start("a"));
    let pipeline = make_pipeline(vec![
        make_step("a", vec![]),
        make_step("b", vec!["a"]),
    ]);

    let report = scheduler(engine.clone()).run(&pipeline).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(state_of(&report, "a"), StepState::Failed);
    assert_eq!(state_of(&report, "b"), StepState::Cancelled);
    // The created-but-unstartable container is still reaped.
    assert!(engine.all_removed());
}

#[tokio::test]
async fn test_create_failure_aborts_and_sweeps_running_containers() {
    let engine = Arc::new(MockEngine::new().fail_create("b"));
    let pipeline = make_pipeline(vec![
        make_step("a", vec![]),
        make_step("b", vec![]),
    ]);

    let err = scheduler(engine.clone()).run(&pipeline).await.unwrap_err();
    assert!(matches!(err, Error::Engine(_)));

    // Step a had been dispatched in the same cycle; the abort path must
    // still reap its container.
    assert!(engine.all_removed());
}

#[tokio::test]
async fn test_cycle_is_a_configuration_error() {
    let engine = Arc::new(MockEngine::new());
    let pipeline = make_pipeline(vec![
        make_step("a", vec!["b"]),
        make_step("b", vec!["a"]),
    ]);

    let err = scheduler(engine.clone()).run(&pipeline).await.unwrap_err();
    assert!(matches!(err, Error::InvalidPipeline(_)));
    assert!(engine.events().is_empty());
}

#[tokio::test]
async fn test_unknown_dependency_is_a_configuration_error() {
    let engine = Arc::new(MockEngine::new());
    let pipeline = make_pipeline(vec![make_step("a", vec!["ghost"])]);

    let err = scheduler(engine.clone()).run(&pipeline).await.unwrap_err();
    assert!(matches!(err, Error::InvalidPipeline(_)));
    assert!(engine.events().is_empty());
}

#[tokio::test]
async fn test_empty_pipeline_runs_the_root_alone() {
    let engine = Arc::new(MockEngine::new());
    let pipeline = make_pipeline(vec![]);

    let report = scheduler(engine.clone()).run(&pipeline).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.steps.len(), 1);
    assert_eq!(state_of(&report, "root"), StepState::Succeeded);
    assert!(engine.all_removed());
}

#[tokio::test]
async fn test_transient_inspect_failure_is_retried() {
    let engine = Arc::new(MockEngine::new().fail_inspect("a", 2));
    let pipeline = make_pipeline(vec![make_step("a", vec![])]);

    let report = scheduler(engine.clone()).run(&pipeline).await.unwrap();

    assert!(report.is_success());
    assert_eq!(state_of(&report, "a"), StepState::Succeeded);
    assert!(engine.all_removed());
}

#[tokio::test]
async fn test_dispatch_passes_environment_and_workspace() {
    let engine = Arc::new(MockEngine::new());
    let mut step = make_step("a", vec![]);
    step.environment = vec!["FOO=bar".to_string(), "BAZ=qux".to_string()];
    let mut pipeline = make_pipeline(vec![step]);
    pipeline.mount = Some("/srv/checkout".to_string());

    scheduler(engine.clone()).run(&pipeline).await.unwrap();

    let spec = engine.spec_of("a");
    assert_eq!(spec.env, vec!["FOO=bar", "BAZ=qux"]);
    assert_eq!(spec.workspace, PathBuf::from("/srv/checkout"));
    assert_eq!(spec.command, vec!["echo", "test"]);
    assert!(spec.name.starts_with("genesis_"));
}

#[tokio::test]
async fn test_empty_mount_falls_back_to_cwd() {
    let engine = Arc::new(MockEngine::new());
    let mut pipeline = make_pipeline(vec![make_step("a", vec![])]);
    pipeline.mount = Some(String::new());

    scheduler(engine.clone()).run(&pipeline).await.unwrap();

    let spec = engine.spec_of("a");
    assert_eq!(spec.workspace, std::env::current_dir().unwrap());
}

#[tokio::test]
async fn test_empty_command_reaches_engine_as_image_default() {
    let engine = Arc::new(MockEngine::new());
    let mut step = make_step("a", vec![]);
    step.command = None;
    let pipeline = make_pipeline(vec![step]);

    scheduler(engine.clone()).run(&pipeline).await.unwrap();

    assert!(engine.spec_of("a").command.is_empty());
}

#[tokio::test]
async fn test_terminal_nodes_are_never_advanced() {
    let pipeline = make_pipeline(vec![make_step("a", vec![])]);
    let mut dag = DagBuilder::new().build(&pipeline).unwrap();
    let order = dag.topological_order().unwrap();

    for state in [StepState::Succeeded, StepState::Failed, StepState::Cancelled] {
        for &idx in &order {
            dag.node_mut(idx).state = state;
        }
        for &idx in &order {
            // PanicEngine aborts the test on any engine call.
            machine::advance(&mut dag, idx, &PanicEngine, std::path::Path::new("/tmp"))
                .await
                .unwrap();
            assert_eq!(dag.node(idx).state, state);
        }
    }
}

#[tokio::test]
async fn test_running_node_without_container_is_an_internal_error() {
    let pipeline = make_pipeline(vec![make_step("a", vec![])]);
    let mut dag = DagBuilder::new().build(&pipeline).unwrap();
    let idx = dag.index_of("a").unwrap();
    dag.node_mut(idx).state = StepState::Running;

    let err = machine::advance(&mut dag, idx, &PanicEngine, std::path::Path::new("/tmp"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
}
