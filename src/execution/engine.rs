//! Workflow Execution Engine
//!
//! The coordinator that turns a workflow definition into a run:
//! - builds the execution plan once per run segment
//! - executes linear plans step by step, graph plans in concurrent rounds
//! - activates conditional connections as steps complete
//! - pauses when a step references data that is not there yet
//! - persists every transition through the [`StateStore`]
//!
//! The store is the source of truth: state is re-read after each mutation
//! that later decisions depend on, and all mutations for one execution
//! are serialized under a single per-run lock. Dispatch itself runs
//! outside the lock.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time;

use super::condition::evaluate_condition;
use super::dispatcher::{Dispatcher, ExecutorRegistry};
use super::error::{EngineError, EngineResult, StepError};
use super::resolver::{resolve_parameters, Resolution};
use super::schema::{validate_input, validate_output};
use crate::config::EngineConfig;
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::store::{
    AnalyticsSink, ExecutionEvent, LogAnalytics, LogNotifier, Notifier, RunMetrics, StateStore,
    WorkflowRepository,
};
use crate::workflow::{
    build_plan, validate_workflow, Connection, ExecutionPlan, ExecutionState, ExecutionStatus,
    NodeType, PauseInfo, Step, StepStatus, WorkflowDefinition, WorkflowGraph,
};

/// Service name handled by the engine itself: runs another workflow.
pub const WORKFLOW_SERVICE: &str = "workflow";

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Identifies one connection in the activated set.
type EdgeKey = (String, String, String);

fn edge_key(conn: &Connection) -> EdgeKey {
    (conn.id.clone(), conn.source.clone(), conn.target.clone())
}

/// What happened to a single step.
#[derive(Debug, Clone, PartialEq)]
enum StepOutcome {
    Completed(Value),
    Skipped,
    Paused(PauseInfo),
    Failed(StepError),
}

/// Why a run loop stopped.
#[derive(Debug)]
enum RunEnd {
    /// No more ready steps
    Drained,
    Paused(PauseInfo),
    Failed(String),
}

/// Mutable run bookkeeping, guarded by the per-run lock.
#[derive(Debug, Default)]
struct RunShared {
    activated: HashSet<EdgeKey>,
    pause: Option<PauseInfo>,
    failure: Option<String>,
    timeline: ExecutionTimeline,
}

/// Everything a step task needs to know about its run.
#[derive(Clone)]
struct RunContext {
    execution_id: String,
    workflow: Arc<WorkflowDefinition>,
    graph: Option<Arc<WorkflowGraph>>,
    step_ids: Arc<Vec<String>>,
    depth: u32,
    shared: Arc<Mutex<RunShared>>,
}

impl RunContext {
    fn user_id(&self) -> Option<&str> {
        self.workflow.user_id.as_deref()
    }
}

/// Whether a failed step stops the whole execution.
fn halts_run(step: &Step, error: &StepError) -> bool {
    error.is_fatal() || !step.config.continue_on_error
}

/// Adds the outgoing connections of `step_id` whose conditions hold.
fn activate_outgoing(
    graph: &WorkflowGraph,
    step_id: &str,
    state: &ExecutionState,
    activated: &mut HashSet<EdgeKey>,
) {
    for conn in graph.outgoing(step_id) {
        let active = conn
            .condition()
            .map_or(true, |condition| evaluate_condition(condition, state));
        if active {
            activated.insert(edge_key(conn));
        } else {
            debug!(
                "Connection '{}' ({} -> {}) not activated",
                conn.id, conn.source, conn.target
            );
        }
    }
}

/// Pending or paused steps whose every incoming connection is activated.
fn ready_steps(graph: &WorkflowGraph, state: &ExecutionState, activated: &HashSet<EdgeKey>) -> Vec<Step> {
    graph
        .order
        .iter()
        .filter(|id| matches!(state.step_status(id), StepStatus::Pending | StepStatus::Paused))
        .filter(|id| {
            graph
                .incoming(id)
                .iter()
                .all(|conn| activated.contains(&edge_key(conn)))
        })
        .filter_map(|id| graph.node(id).cloned())
        .collect()
}

/// One graph step run under a concurrency permit.
async fn step_task(
    engine: Engine,
    ctx: RunContext,
    step: Step,
    limiter: Arc<Semaphore>,
) -> EngineResult<()> {
    let _permit = limiter
        .acquire_owned()
        .await
        .map_err(|e| EngineError::TaskAborted(e.to_string()))?;

    // A pause abandons the rest of the round
    if ctx.shared.lock().await.pause.is_some() {
        debug!("Not starting step '{}': execution is pausing", step.id);
        return Ok(());
    }
    engine.execute_step(&ctx, &step).await?;
    Ok(())
}

/// A nested execution the caller is still waiting on.
///
/// Dropping it while armed (an enclosing run gave up on this one) fails
/// the nested execution in the background so it does not stay RUNNING.
struct NestedRun {
    engine: Engine,
    workflow: Arc<WorkflowDefinition>,
    execution_id: String,
    started: time::Instant,
    armed: bool,
}

impl NestedRun {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for NestedRun {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                "Execution {} abandoned without a runtime to record it",
                self.execution_id
            );
            return;
        };
        let engine = self.engine.clone();
        let workflow = self.workflow.clone();
        let execution_id = self.execution_id.clone();
        let elapsed = self.started.elapsed();
        handle.spawn(async move {
            engine
                .abandon(&workflow, &execution_id, "caller stopped waiting", elapsed)
                .await;
        });
    }
}

/// Workflow execution engine.
///
/// Cheap to clone; clones share the registry and collaborators.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use flowpilot::execution::{BuiltinExecutor, Engine, ExecutorRegistry};
/// use flowpilot::store::InMemoryStateStore;
/// use flowpilot::workflow::load_workflow;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("onboarding.yaml")?;
///     let registry = ExecutorRegistry::new().with("builtin", BuiltinExecutor);
///
///     let mut engine = Engine::new(registry, Arc::new(InMemoryStateStore::new()));
///     engine.set_max_concurrency(4);
///
///     let state = engine.run(&workflow, serde_json::Map::new()).await?;
///     println!("{}: {}", state.execution_id, state.status);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Engine {
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    analytics: Arc<dyn AnalyticsSink>,
    workflows: Option<Arc<dyn WorkflowRepository>>,
    config: EngineConfig,
}

impl Engine {
    /// Creates an engine with log-backed notifier and analytics.
    pub fn new(registry: ExecutorRegistry, store: Arc<dyn StateStore>) -> Self {
        let config = EngineConfig::default();
        let mut dispatcher = Dispatcher::new(registry);
        dispatcher.set_retry_policy(config.retry.clone());
        Self {
            dispatcher: Arc::new(dispatcher),
            store,
            notifier: Arc::new(LogNotifier),
            analytics: Arc::new(LogAnalytics),
            workflows: None,
            config,
        }
    }

    pub fn set_notifier(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifier = notifier;
    }

    pub fn set_analytics(&mut self, analytics: Arc<dyn AnalyticsSink>) {
        self.analytics = analytics;
    }

    /// Sets where `workflow` steps look up the workflows they run.
    pub fn set_workflow_repository(&mut self, workflows: Arc<dyn WorkflowRepository>) {
        self.workflows = Some(workflows);
    }

    pub fn set_config(&mut self, config: EngineConfig) {
        let config = config.normalized();
        Arc::make_mut(&mut self.dispatcher).set_retry_policy(config.retry.clone());
        self.config = config;
    }

    /// Sets the maximum number of graph steps running at once.
    pub fn set_max_concurrency(&mut self, max: usize) {
        let mut config = self.config.clone();
        config.max_concurrency = max;
        self.config = config.normalized();
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Runs a workflow from the start.
    ///
    /// Ordinary step failures do not make this fail: they are reported
    /// through the returned state's status, step states and error list.
    ///
    /// # Errors
    ///
    /// * [`EngineError::InvalidWorkflow`] - the definition fails validation
    /// * [`EngineError::Store`] - the state store failed
    pub async fn run(
        &self,
        workflow: &WorkflowDefinition,
        input_data: Map<String, Value>,
    ) -> EngineResult<ExecutionState> {
        let workflow = Arc::new(workflow.clone());
        let (plan, execution_id) = self.start(&workflow, input_data, 0).await?;
        self.drive(workflow, plan, execution_id, 0).await
    }

    /// Resumes a paused execution with newly supplied input.
    ///
    /// The new keys are merged into the stored input data; steps that
    /// completed before the pause are not run again.
    ///
    /// # Errors
    ///
    /// * [`EngineError::NotPaused`] - the execution is in any other status
    /// * [`EngineError::InvalidWorkflow`] - the definition is invalid or
    ///   belongs to a different workflow
    pub async fn resume(
        &self,
        workflow: &WorkflowDefinition,
        execution_id: &str,
        new_inputs: Map<String, Value>,
    ) -> EngineResult<ExecutionState> {
        let state = self.store.get_execution_state(execution_id).await?;
        if state.status != ExecutionStatus::Paused {
            return Err(EngineError::NotPaused {
                execution_id: execution_id.to_string(),
                status: state.status,
            });
        }
        if state.workflow_id != workflow.id {
            return Err(EngineError::InvalidWorkflow(format!(
                "execution '{}' belongs to workflow '{}', not '{}'",
                execution_id, state.workflow_id, workflow.id
            )));
        }

        let workflow = Arc::new(workflow.clone());
        let plan = self.plan(&workflow)?;

        info!(
            "Resuming execution {} of '{}' with {} new input(s)",
            execution_id,
            workflow.id,
            new_inputs.len()
        );
        self.store
            .update_execution_inputs(execution_id, new_inputs)
            .await?;
        // Paused steps stay PAUSED until they are picked up again
        self.store.set_pause_info(execution_id, None).await?;

        self.drive(workflow, plan, execution_id.to_string(), 0).await
    }

    fn plan(&self, workflow: &WorkflowDefinition) -> EngineResult<ExecutionPlan> {
        validate_workflow(workflow).map_err(EngineError::InvalidWorkflow)?;
        build_plan(workflow).map_err(|e| EngineError::InvalidWorkflow(e.to_string()))
    }

    /// Plans the workflow and creates its execution record.
    async fn start(
        &self,
        workflow: &WorkflowDefinition,
        input_data: Map<String, Value>,
        depth: u32,
    ) -> EngineResult<(ExecutionPlan, String)> {
        let plan = self.plan(workflow)?;
        let execution_id = self
            .store
            .create_execution(&workflow.id, input_data)
            .await?;
        info!(
            "Starting execution {} of workflow '{}' ({} mode{})",
            execution_id,
            workflow.id,
            if plan.is_linear() { "linear" } else { "graph" },
            if depth > 0 {
                format!(", depth {}", depth)
            } else {
                String::new()
            }
        );
        Ok((plan, execution_id))
    }

    /// Boxed entry point for nested runs; breaks the async recursion.
    fn run_nested(
        &self,
        workflow: Arc<WorkflowDefinition>,
        plan: ExecutionPlan,
        execution_id: String,
        depth: u32,
    ) -> BoxFuture<'_, EngineResult<ExecutionState>> {
        Box::pin(self.drive(workflow, plan, execution_id, depth))
    }

    /// Runs one segment of an execution, from RUNNING to a stop point.
    async fn drive(
        &self,
        workflow: Arc<WorkflowDefinition>,
        plan: ExecutionPlan,
        execution_id: String,
        depth: u32,
    ) -> EngineResult<ExecutionState> {
        let (graph, step_ids): (Option<Arc<WorkflowGraph>>, Vec<String>) = match &plan {
            ExecutionPlan::Linear(steps) => (None, steps.iter().map(|s| s.id.clone()).collect()),
            ExecutionPlan::Graph(graph) => (Some(Arc::new(graph.clone())), graph.order.clone()),
        };
        let ctx = RunContext {
            execution_id,
            workflow,
            graph,
            step_ids: Arc::new(step_ids),
            depth,
            shared: Arc::new(Mutex::new(RunShared::default())),
        };

        self.store
            .update_execution_status(&ctx.execution_id, ExecutionStatus::Running, None)
            .await?;
        self.notify(
            &ctx,
            ExecutionEvent::Running,
            json!({"workflow_id": ctx.workflow.id}),
        )
        .await;

        let end = match &plan {
            ExecutionPlan::Linear(steps) => self.run_linear(&ctx, steps).await?,
            ExecutionPlan::Graph(_) => self.run_graph(&ctx).await?,
        };
        self.conclude(&ctx, end).await
    }

    /// Executes steps strictly in order.
    async fn run_linear(&self, ctx: &RunContext, steps: &[Step]) -> EngineResult<RunEnd> {
        for step in steps {
            let state = self.snapshot(ctx).await?;
            if state.is_step_completed(&step.id) {
                debug!("Step '{}' already completed, skipping", step.id);
                continue;
            }

            match self.execute_step(ctx, step).await? {
                StepOutcome::Paused(pause) => return Ok(RunEnd::Paused(pause)),
                StepOutcome::Failed(e) if halts_run(step, &e) => {
                    return Ok(RunEnd::Failed(format!(
                        "Execution stopped at step '{}'",
                        step.id
                    )))
                }
                _ => {}
            }
        }
        Ok(RunEnd::Drained)
    }

    /// Executes ready steps in concurrent rounds until none are ready.
    async fn run_graph(&self, ctx: &RunContext) -> EngineResult<RunEnd> {
        let Some(graph) = ctx.graph.clone() else {
            return Ok(RunEnd::Drained);
        };

        // Completed steps from an earlier segment re-derive their edges
        {
            let mut shared = ctx.shared.lock().await;
            let state = self.store.get_execution_state(&ctx.execution_id).await?;
            for id in &graph.order {
                if state.is_step_completed(id) {
                    activate_outgoing(&graph, id, &state, &mut shared.activated);
                }
            }
        }

        let limiter = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut round = 0;

        loop {
            let ready = {
                let shared = ctx.shared.lock().await;
                let state = self.store.get_execution_state(&ctx.execution_id).await?;
                ready_steps(&graph, &state, &shared.activated)
            };
            if ready.is_empty() {
                break;
            }

            round += 1;
            debug!(
                "Round {}: {:?}",
                round,
                ready.iter().map(|s| s.id.as_str()).collect::<Vec<_>>()
            );

            let mut tasks = JoinSet::new();
            for step in ready {
                tasks.spawn(step_task(self.clone(), ctx.clone(), step, limiter.clone()));
            }

            let mut task_error = None;
            while let Some(joined) = tasks.join_next().await {
                let result = joined.unwrap_or_else(|e| Err(EngineError::TaskAborted(e.to_string())));
                if let Err(e) = result {
                    error!("Step task in execution {} failed: {}", ctx.execution_id, e);
                    task_error.get_or_insert(e);
                }
            }
            if let Some(e) = task_error {
                return Err(e);
            }

            let shared = ctx.shared.lock().await;
            if let Some(message) = &shared.failure {
                return Ok(RunEnd::Failed(message.clone()));
            }
            if let Some(pause) = &shared.pause {
                return Ok(RunEnd::Paused(pause.clone()));
            }
        }

        Ok(RunEnd::Drained)
    }

    async fn snapshot(&self, ctx: &RunContext) -> EngineResult<ExecutionState> {
        let _guard = ctx.shared.lock().await;
        Ok(self.store.get_execution_state(&ctx.execution_id).await?)
    }

    /// Runs one step through its whole lifecycle and records the outcome.
    async fn execute_step(&self, ctx: &RunContext, step: &Step) -> EngineResult<StepOutcome> {
        let state = self.snapshot(ctx).await?;

        if let Some(condition) = step.config.condition.as_deref() {
            if !evaluate_condition(condition, &state) {
                info!("Skipping step '{}': condition is false", step.id);
                let outcome = StepOutcome::Skipped;
                self.record(ctx, step, &outcome).await?;
                return Ok(outcome);
            }
        }

        let state = self.mark_running(ctx, step).await?;
        let outcome = match resolve_parameters(&step.config.parameters, &state) {
            Resolution::Missing(path) => {
                warn!(
                    "Step '{}' is waiting for '{}'; pausing execution {}",
                    step.id, path, ctx.execution_id
                );
                StepOutcome::Paused(PauseInfo {
                    step_id: step.id.clone(),
                    missing_var: path,
                })
            }
            Resolution::Ready(params) => match self.invoke(ctx, step, &state, params).await {
                Ok(output) => StepOutcome::Completed(output),
                Err(e) => StepOutcome::Failed(e),
            },
        };

        self.record(ctx, step, &outcome).await?;
        Ok(outcome)
    }

    async fn mark_running(&self, ctx: &RunContext, step: &Step) -> EngineResult<ExecutionState> {
        let state = {
            let mut shared = ctx.shared.lock().await;
            self.store
                .update_step_status(&ctx.execution_id, &step.id, StepStatus::Running, None, None)
                .await?;
            shared.timeline.add_event(&step.id, EventType::Started);
            self.store.get_execution_state(&ctx.execution_id).await?
        };
        self.notify(
            ctx,
            ExecutionEvent::StepRunning,
            json!({"step_id": step.id, "title": step.label()}),
        )
        .await;
        Ok(state)
    }

    /// Validates, dispatches and validates again.
    async fn invoke(
        &self,
        ctx: &RunContext,
        step: &Step,
        state: &ExecutionState,
        params: Map<String, Value>,
    ) -> Result<Value, StepError> {
        validate_input(step, &params)?;

        let output = match step.service() {
            None if step.node_type == NodeType::Trigger => Value::Object(state.input_data.clone()),
            Some(WORKFLOW_SERVICE) => self.run_sub_workflow(ctx, step, &params).await?,
            _ => {
                let result = self.dispatcher.execute(step, &params).await?;
                if result.fallback_used {
                    info!(
                        "Step '{}' completed on fallback service '{}'",
                        step.id, result.service_used
                    );
                }
                result.output
            }
        };

        validate_output(step, &output)?;
        Ok(output)
    }

    /// Runs the workflow named by the step and waits for it to finish.
    async fn run_sub_workflow(
        &self,
        ctx: &RunContext,
        step: &Step,
        params: &Map<String, Value>,
    ) -> Result<Value, StepError> {
        let max_depth = self.config.max_workflow_depth;
        let depth = ctx.depth + 1;
        if depth > max_depth {
            return Err(StepError::RecursionLimit { limit: max_depth });
        }

        let step_error = |message: String| StepError::Execution {
            step_id: step.id.clone(),
            message,
        };

        let workflow_id = params
            .get("workflow_id")
            .and_then(Value::as_str)
            .ok_or_else(|| step_error("missing 'workflow_id' parameter".to_string()))?;
        let input = match params.get("input") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(input)) => input.clone(),
            Some(other) => {
                return Err(step_error(format!("'input' must be an object, found {}", other)))
            }
        };

        let repository = self
            .workflows
            .as_ref()
            .ok_or_else(|| step_error("no workflow repository configured".to_string()))?;
        let workflow = repository
            .get_workflow(workflow_id)
            .await
            .ok_or_else(|| step_error(format!("workflow '{}' not found", workflow_id)))?;

        info!(
            "Step '{}' starts sub-workflow '{}' at depth {}",
            step.id, workflow_id, depth
        );
        let workflow = Arc::new(workflow);
        let (plan, child_id) = self
            .start(&workflow, input, depth)
            .await
            .map_err(|e| step_error(e.to_string()))?;
        let mut guard = NestedRun {
            engine: self.clone(),
            workflow: workflow.clone(),
            execution_id: child_id.clone(),
            started: time::Instant::now(),
            armed: true,
        };

        let nested = self.run_nested(workflow.clone(), plan, child_id.clone(), depth);
        let result = match step.timeout() {
            Some(limit) => match time::timeout(limit, nested).await {
                Ok(result) => result,
                Err(_) => {
                    guard.disarm();
                    let error = StepError::Timeout {
                        step_id: step.id.clone(),
                        limit,
                    };
                    self.abandon(&workflow, &child_id, &error.to_string(), guard.started.elapsed())
                        .await;
                    return Err(error);
                }
            },
            None => nested.await,
        };
        guard.disarm();
        let nested_state = result.map_err(|e| step_error(e.to_string()))?;

        match nested_state.status {
            ExecutionStatus::Completed => Ok(json!({
                "execution_id": nested_state.execution_id,
                "status": nested_state.status,
                "outputs": nested_state.outputs,
            })),
            status => {
                let message = match (&nested_state.pause, nested_state.errors.first()) {
                    (Some(pause), _) => format!("waiting for '{}'", pause.missing_var),
                    (None, Some(first)) => first.clone(),
                    (None, None) => "not every step completed".to_string(),
                };
                Err(StepError::SubWorkflow {
                    workflow_id: workflow_id.to_string(),
                    status,
                    message,
                })
            }
        }
    }

    /// Persists a step outcome and updates run bookkeeping.
    async fn record(&self, ctx: &RunContext, step: &Step, outcome: &StepOutcome) -> EngineResult<()> {
        let id = ctx.execution_id.as_str();
        let (event, payload) = {
            let mut shared = ctx.shared.lock().await;
            match outcome {
                StepOutcome::Completed(output) => {
                    self.store
                        .update_step_status(id, &step.id, StepStatus::Completed, Some(output.clone()), None)
                        .await?;
                    shared.timeline.add_event(&step.id, EventType::Completed);
                    if let Some(graph) = &ctx.graph {
                        let state = self.store.get_execution_state(id).await?;
                        activate_outgoing(graph, &step.id, &state, &mut shared.activated);
                    }
                    info!("Step '{}' completed", step.id);
                    (
                        Some(ExecutionEvent::StepCompleted),
                        json!({"step_id": step.id, "output": output}),
                    )
                }
                StepOutcome::Skipped => {
                    self.store
                        .update_step_status(id, &step.id, StepStatus::Skipped, None, None)
                        .await?;
                    shared.timeline.add_event(&step.id, EventType::Skipped);
                    (Some(ExecutionEvent::StepSkipped), json!({"step_id": step.id}))
                }
                StepOutcome::Paused(pause) => {
                    self.store
                        .update_step_status(id, &step.id, StepStatus::Paused, None, None)
                        .await?;
                    shared.timeline.add_event(&step.id, EventType::Paused);
                    shared.pause.get_or_insert_with(|| pause.clone());
                    (None, Value::Null)
                }
                StepOutcome::Failed(e) => {
                    self.store
                        .update_step_status(id, &step.id, StepStatus::Failed, None, Some(e.to_string()))
                        .await?;
                    shared.timeline.add_event(&step.id, EventType::Failed);
                    if halts_run(step, e) {
                        error!("Step '{}' failed: {}", step.id, e);
                        shared
                            .failure
                            .get_or_insert_with(|| format!("Execution stopped at step '{}'", step.id));
                    } else {
                        warn!("Step '{}' failed, continuing: {}", step.id, e);
                    }
                    (
                        Some(ExecutionEvent::StepFailed),
                        json!({"step_id": step.id, "error": e.to_string()}),
                    )
                }
            }
        };

        if let Some(event) = event {
            self.notify(ctx, event, payload).await;
        }
        Ok(())
    }

    /// Persists the segment's final status and reports it.
    async fn conclude(&self, ctx: &RunContext, end: RunEnd) -> EngineResult<ExecutionState> {
        let id = ctx.execution_id.as_str();

        let status = match end {
            RunEnd::Paused(pause) => {
                info!(
                    "Execution {} paused at step '{}' waiting for '{}'",
                    id, pause.step_id, pause.missing_var
                );
                self.store.set_pause_info(id, Some(pause.clone())).await?;
                self.store
                    .update_execution_status(id, ExecutionStatus::Paused, None)
                    .await?;
                self.notify(
                    ctx,
                    ExecutionEvent::Paused,
                    json!({"step_id": pause.step_id, "missing_var": pause.missing_var}),
                )
                .await;
                ExecutionStatus::Paused
            }
            RunEnd::Failed(message) => {
                self.store
                    .update_execution_status(id, ExecutionStatus::Failed, Some(message.clone()))
                    .await?;
                self.notify(ctx, ExecutionEvent::Failed, json!({"error": message}))
                    .await;
                ExecutionStatus::Failed
            }
            RunEnd::Drained => {
                let state = self.store.get_execution_state(id).await?;
                let pending: Vec<&String> = ctx
                    .step_ids
                    .iter()
                    .filter(|step_id| !state.is_step_completed(step_id))
                    .collect();
                let status = if pending.is_empty() {
                    ExecutionStatus::Completed
                } else {
                    debug!("Steps not completed: {:?}", pending);
                    ExecutionStatus::Partial
                };
                self.store.update_execution_status(id, status, None).await?;
                if let Some(event) = ExecutionEvent::for_status(status) {
                    self.notify(ctx, event, json!({"outputs": state.outputs}))
                        .await;
                }
                status
            }
        };

        let elapsed = {
            let shared = ctx.shared.lock().await;
            debug!("{}", shared.timeline.gantt_chart());
            shared.timeline.elapsed()
        };
        info!(
            "Execution {} finished segment as {} in {:.2}s",
            id,
            status,
            elapsed.as_secs_f64()
        );

        if status != ExecutionStatus::Paused {
            self.track(ctx, status, elapsed).await;
        }

        Ok(self.store.get_execution_state(id).await?)
    }

    /// Fails a nested execution its caller stopped waiting for.
    ///
    /// Steps left RUNNING are failed with `reason`. An execution that
    /// already reached a terminal status is left alone.
    async fn abandon(
        &self,
        workflow: &WorkflowDefinition,
        execution_id: &str,
        reason: &str,
        elapsed: Duration,
    ) {
        match self.fail_abandoned(execution_id, reason).await {
            Ok(true) => {
                warn!("Execution {} of '{}' abandoned: {}", execution_id, workflow.id, reason);
                self.notify_to(
                    workflow.user_id.as_deref(),
                    execution_id,
                    ExecutionEvent::Failed,
                    json!({"error": reason}),
                )
                .await;
                self.track_run(workflow, ExecutionStatus::Failed, elapsed).await;
            }
            Ok(false) => {}
            Err(e) => error!("Could not fail abandoned execution {}: {}", execution_id, e),
        }
    }

    async fn fail_abandoned(&self, execution_id: &str, reason: &str) -> EngineResult<bool> {
        let state = self.store.get_execution_state(execution_id).await?;
        if state.status.is_terminal() {
            return Ok(false);
        }
        for step_id in state.steps_with_status(StepStatus::Running) {
            self.store
                .update_step_status(execution_id, &step_id, StepStatus::Failed, None, Some(reason.to_string()))
                .await?;
        }
        self.store
            .update_execution_status(execution_id, ExecutionStatus::Failed, Some(reason.to_string()))
            .await?;
        Ok(true)
    }

    async fn notify(&self, ctx: &RunContext, event: ExecutionEvent, payload: Value) {
        self.notify_to(ctx.user_id(), &ctx.execution_id, event, payload)
            .await;
    }

    async fn notify_to(
        &self,
        user_id: Option<&str>,
        execution_id: &str,
        event: ExecutionEvent,
        payload: Value,
    ) {
        if let Err(e) = self
            .notifier
            .notify(user_id, execution_id, event, &payload)
            .await
        {
            warn!(
                "Failed to send {} notification for execution {}: {}",
                event, execution_id, e
            );
        }
    }

    async fn track(&self, ctx: &RunContext, status: ExecutionStatus, elapsed: Duration) {
        self.track_run(&ctx.workflow, status, elapsed).await;
    }

    async fn track_run(&self, workflow: &WorkflowDefinition, status: ExecutionStatus, elapsed: Duration) {
        let metrics = RunMetrics {
            workflow_id: workflow.id.clone(),
            success: status == ExecutionStatus::Completed,
            duration_seconds: elapsed.as_secs_f64(),
            time_saved_seconds: workflow.time_saved_seconds,
            business_value: workflow.business_value,
        };
        if let Err(e) = self.analytics.track_workflow_execution(&metrics).await {
            warn!("Failed to record analytics for '{}': {}", metrics.workflow_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::builtin::{BuiltinExecutor, BUILTIN_SERVICE};
    use crate::execution::dispatcher::FnExecutor;
    use crate::execution::error::{ExecutorError, StoreError};
    use crate::store::{CollaboratorError, FileStateStore, InMemoryStateStore, InMemoryWorkflowRepository};
    use crate::workflow::Node;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingNotifier {
        events: StdMutex<Vec<(String, ExecutionEvent, Value)>>,
    }

    impl RecordingNotifier {
        fn events(&self) -> Vec<ExecutionEvent> {
            self.events.lock().unwrap().iter().map(|(_, e, _)| *e).collect()
        }

        fn payloads(&self, event: ExecutionEvent) -> Vec<Value> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, e, _)| *e == event)
                .map(|(_, _, p)| p.clone())
                .collect()
        }

        /// Execution id of the first run of `workflow_id`.
        fn execution_of(&self, workflow_id: &str) -> String {
            self.events
                .lock()
                .unwrap()
                .iter()
                .find(|(_, e, p)| *e == ExecutionEvent::Running && p["workflow_id"] == workflow_id)
                .map(|(id, _, _)| id.clone())
                .unwrap()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(
            &self,
            _user_id: Option<&str>,
            execution_id: &str,
            event: ExecutionEvent,
            payload: &Value,
        ) -> Result<(), CollaboratorError> {
            self.events
                .lock()
                .unwrap()
                .push((execution_id.to_string(), event, payload.clone()));
            Ok(())
        }
    }

    /// In-memory store that also keeps every step status write.
    #[derive(Default)]
    struct TransitionStore {
        inner: InMemoryStateStore,
        writes: StdMutex<Vec<(String, StepStatus)>>,
    }

    impl TransitionStore {
        fn history(&self, step_id: &str) -> Vec<StepStatus> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == step_id)
                .map(|(_, status)| *status)
                .collect()
        }
    }

    #[async_trait]
    impl StateStore for TransitionStore {
        async fn create_execution(
            &self,
            workflow_id: &str,
            input_data: Map<String, Value>,
        ) -> Result<String, StoreError> {
            self.inner.create_execution(workflow_id, input_data).await
        }

        async fn get_execution_state(&self, execution_id: &str) -> Result<ExecutionState, StoreError> {
            self.inner.get_execution_state(execution_id).await
        }

        async fn update_step_status(
            &self,
            execution_id: &str,
            step_id: &str,
            status: StepStatus,
            output: Option<Value>,
            error: Option<String>,
        ) -> Result<(), StoreError> {
            self.writes.lock().unwrap().push((step_id.to_string(), status));
            self.inner
                .update_step_status(execution_id, step_id, status, output, error)
                .await
        }

        async fn update_execution_status(
            &self,
            execution_id: &str,
            status: ExecutionStatus,
            error: Option<String>,
        ) -> Result<(), StoreError> {
            self.inner.update_execution_status(execution_id, status, error).await
        }

        async fn update_execution_inputs(
            &self,
            execution_id: &str,
            inputs: Map<String, Value>,
        ) -> Result<(), StoreError> {
            self.inner.update_execution_inputs(execution_id, inputs).await
        }

        async fn set_pause_info(
            &self,
            execution_id: &str,
            pause: Option<PauseInfo>,
        ) -> Result<(), StoreError> {
            self.inner.set_pause_info(execution_id, pause).await
        }
    }

    struct BrokenNotifier;

    #[async_trait]
    impl Notifier for BrokenNotifier {
        async fn notify(
            &self,
            _user_id: Option<&str>,
            _execution_id: &str,
            _event: ExecutionEvent,
            _payload: &Value,
        ) -> Result<(), CollaboratorError> {
            Err("channel closed".into())
        }
    }

    #[derive(Default)]
    struct RecordingAnalytics {
        runs: StdMutex<Vec<RunMetrics>>,
    }

    #[async_trait]
    impl AnalyticsSink for RecordingAnalytics {
        async fn track_workflow_execution(&self, metrics: &RunMetrics) -> Result<(), CollaboratorError> {
            self.runs.lock().unwrap().push(metrics.clone());
            Ok(())
        }
    }

    struct Harness {
        engine: Engine,
        notifier: Arc<RecordingNotifier>,
        analytics: Arc<RecordingAnalytics>,
    }

    fn harness(registry: ExecutorRegistry) -> Harness {
        let registry = registry.with(BUILTIN_SERVICE, BuiltinExecutor);
        let mut engine = Engine::new(registry, Arc::new(InMemoryStateStore::new()));
        let notifier = Arc::new(RecordingNotifier::default());
        let analytics = Arc::new(RecordingAnalytics::default());
        engine.set_notifier(notifier.clone());
        engine.set_analytics(analytics.clone());
        Harness {
            engine,
            notifier,
            analytics,
        }
    }

    fn echo(id: &str) -> Node {
        Node::action(id, BUILTIN_SERVICE, "echo")
    }

    fn fail(id: &str, message: &str) -> Node {
        Node::action(id, BUILTIN_SERVICE, "fail").with_param("message", message)
    }

    fn inputs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    /// Counts calls per action and echoes parameters.
    fn counting(calls: Arc<AtomicUsize>) -> FnExecutor {
        FnExecutor::new(move |_, params| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Object(params))
            }
        })
    }

    fn hanging() -> FnExecutor {
        FnExecutor::new(|_, _| async {
            time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        })
    }

    #[tokio::test]
    async fn test_reference_to_previous_output() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf")
            .with_node(echo("A").with_param("x", 1))
            .with_node(echo("B").with_param("x", "${A.x}"))
            .connect("A", "B");

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(state.outputs["B"], json!({"x": 1}));
        assert!(state.errors.is_empty());
    }

    #[tokio::test]
    async fn test_false_edge_leaves_partial() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf")
            .with_node(echo("A").with_param("ok", false))
            .with_node(echo("B"))
            .connect_if("A", "B", "${A.ok} == true");

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Partial);
        assert_eq!(state.step_status("A"), StepStatus::Completed);
        assert_eq!(state.step_status("B"), StepStatus::Pending);
        assert!(!state.outputs.contains_key("B"));
        assert!(h.notifier.events().contains(&ExecutionEvent::Partial));
    }

    #[tokio::test]
    async fn test_true_edge_completes() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf")
            .with_node(echo("A").with_param("ok", true))
            .with_node(echo("B"))
            .connect_if("A", "B", "${A.ok} == true");

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_missing_input_pauses_then_resumes() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf")
            .with_node(echo("C").with_param("to", "${input.email}"))
            .with_node(echo("D"))
            .connect("C", "D");

        let paused = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        let pause = paused.pause.clone().unwrap();
        assert_eq!(pause.step_id, "C");
        assert_eq!(pause.missing_var, "input.email");
        assert_eq!(paused.step_status("C"), StepStatus::Paused);
        assert_eq!(paused.step_status("D"), StepStatus::Pending);
        assert!(h.notifier.events().contains(&ExecutionEvent::Paused));
        assert!(h.analytics.runs.lock().unwrap().is_empty());

        let resumed = h
            .engine
            .resume(&wf, &paused.execution_id, inputs(json!({"email": "a@b.com"})))
            .await
            .unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Completed);
        assert_eq!(resumed.outputs["C"], json!({"to": "a@b.com"}));
        assert!(resumed.pause.is_none());
        assert_eq!(h.analytics.runs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_does_not_rerun_completed_steps() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = harness(ExecutorRegistry::new().with("count", counting(calls.clone())));
        let wf = WorkflowDefinition::new("wf")
            .with_node(Node::action("A", "count", "run").with_param("v", 1))
            .with_node(Node::action("B", "count", "run").with_param("who", "${input.name}"))
            .connect("A", "B");

        let paused = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let resumed = h
            .engine
            .resume(&wf, &paused.execution_id, inputs(json!({"name": "ada"})))
            .await
            .unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_graph_resume_reseeds_activations() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = harness(ExecutorRegistry::new().with("count", counting(calls.clone())));
        let wf = WorkflowDefinition::new("wf")
            .with_node(Node::action("A", "count", "run").with_param("go", true))
            .with_node(Node::action("B", "count", "run").with_param("who", "${input.name}"))
            .with_node(Node::action("C", "count", "run"))
            .connect_if("A", "B", "${A.go} == true")
            .connect("B", "C");

        let paused = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.step_status("C"), StepStatus::Pending);

        let resumed = h
            .engine
            .resume(&wf, &paused.execution_id, inputs(json!({"name": "ada"})))
            .await
            .unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Completed);
        assert_eq!(resumed.outputs["B"], json!({"who": "ada"}));
        // A ran once, B and C once each after the resume
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_resume_requires_paused() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf").with_node(echo("A"));
        let done = h.engine.run(&wf, Map::new()).await.unwrap();

        let err = h
            .engine
            .resume(&wf, &done.execution_id, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::NotPaused {
                status: ExecutionStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_resume_rejects_other_workflow() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf").with_node(echo("A").with_param("x", "${input.x}"));
        let paused = h.engine.run(&wf, Map::new()).await.unwrap();

        let other = WorkflowDefinition::new("other").with_node(echo("A"));
        let err = h
            .engine
            .resume(&other, &paused.execution_id, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidWorkflow(_)));
    }

    #[tokio::test]
    async fn test_resume_without_value_pauses_again() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf").with_node(echo("A").with_param("x", "${input.x}"));
        let paused = h.engine.run(&wf, Map::new()).await.unwrap();

        let again = h
            .engine
            .resume(&wf, &paused.execution_id, inputs(json!({"y": 1})))
            .await
            .unwrap();
        assert_eq!(again.status, ExecutionStatus::Paused);
        assert_eq!(again.input_data["y"], json!(1));
    }

    #[tokio::test]
    async fn test_resume_moves_paused_step_straight_to_running() {
        for graph_mode in [false, true] {
            let store = Arc::new(TransitionStore::default());
            let registry = ExecutorRegistry::new().with(BUILTIN_SERVICE, BuiltinExecutor);
            let engine = Engine::new(registry, store.clone());
            let wf = WorkflowDefinition::new("wf")
                .with_node(echo("A").with_param("go", true))
                .with_node(echo("B").with_param("to", "${input.email}"));
            let wf = if graph_mode {
                wf.connect_if("A", "B", "${A.go} == true")
            } else {
                wf.connect("A", "B")
            };

            let paused = engine.run(&wf, Map::new()).await.unwrap();
            assert_eq!(paused.status, ExecutionStatus::Paused);
            let resumed = engine
                .resume(&wf, &paused.execution_id, inputs(json!({"email": "a@b.com"})))
                .await
                .unwrap();
            assert_eq!(resumed.status, ExecutionStatus::Completed);

            assert_eq!(
                store.history("B"),
                vec![
                    StepStatus::Running,
                    StepStatus::Paused,
                    StepStatus::Running,
                    StepStatus::Completed,
                ],
                "graph mode: {}",
                graph_mode
            );
            assert_eq!(store.history("A"), vec![StepStatus::Running, StepStatus::Completed]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_workflow() {
        let h = harness(ExecutorRegistry::new().with("slow", hanging()));
        let wf = WorkflowDefinition::new("wf")
            .with_node(Node::action("D", "slow", "wait").with_timeout(1.0))
            .with_node(echo("E"))
            .connect("D", "E");

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert_eq!(state.step_status("D"), StepStatus::Failed);
        assert_eq!(state.step_status("E"), StepStatus::Pending);
        let error = state.steps["D"].error.clone().unwrap();
        assert!(error.contains("timed out after 1s"), "{}", error);
    }

    #[tokio::test]
    async fn test_oversized_timeout_runs_unbounded() {
        let mut h = harness(ExecutorRegistry::new());
        let child = WorkflowDefinition::new("child").with_node(echo("inner"));
        h.engine
            .set_workflow_repository(Arc::new(InMemoryWorkflowRepository::from_workflows([child])));

        let linear = WorkflowDefinition::new("linear")
            .with_node(echo("A").with_timeout(1e20))
            .with_node(
                Node::action("call", WORKFLOW_SERVICE, "run")
                    .with_param("workflow_id", "child")
                    .with_timeout(f64::MAX),
            )
            .connect("A", "call");
        let state = h.engine.run(&linear, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);

        let graph = WorkflowDefinition::new("graph")
            .with_node(echo("A").with_param("go", true))
            .with_node(echo("B").with_timeout(1e20))
            .connect_if("A", "B", "${A.go}");
        let state = h.engine.run(&graph, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_failure_stops_linear_run() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf")
            .with_node(fail("A", "boom"))
            .with_node(echo("B"))
            .connect("A", "B");

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert_eq!(state.step_status("B"), StepStatus::Pending);
        assert_eq!(state.errors[0], "A: step 'A' failed: boom");
        assert!(state.errors.iter().any(|e| e.contains("stopped at step 'A'")));

        let runs = h.analytics.runs.lock().unwrap();
        assert_eq!(runs.len(), 1);
        assert!(!runs[0].success);
    }

    #[tokio::test]
    async fn test_continue_on_error_gives_partial() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf")
            .with_node(fail("A", "boom").continue_on_error())
            .with_node(echo("B"))
            .connect("A", "B");

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Partial);
        assert_eq!(state.step_status("A"), StepStatus::Failed);
        assert_eq!(state.step_status("B"), StepStatus::Completed);
        assert!(h.notifier.events().contains(&ExecutionEvent::StepFailed));
    }

    #[tokio::test]
    async fn test_unknown_service_fails_despite_continue_on_error() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf")
            .with_node(Node::action("A", "ghost", "run").continue_on_error())
            .with_node(echo("B"))
            .connect("A", "B");

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert!(state.steps["A"].error.as_deref().unwrap().contains("'ghost'"));
        assert_eq!(state.step_status("B"), StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_step_condition_skips() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf")
            .with_node(echo("A").with_param("vip", false))
            .with_node(echo("B").with_condition("${A.vip} == true"))
            .with_node(echo("C"))
            .connect("A", "B")
            .connect("B", "C");

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.step_status("B"), StepStatus::Skipped);
        assert_eq!(state.step_status("C"), StepStatus::Completed);
        assert_eq!(state.status, ExecutionStatus::Partial);
        assert_eq!(
            h.notifier.payloads(ExecutionEvent::StepSkipped),
            vec![json!({"step_id": "B"})]
        );
    }

    #[tokio::test]
    async fn test_fallback_output_is_tagged() {
        let registry = ExecutorRegistry::new().with(
            "primary",
            FnExecutor::new(|_, _| async { Err(ExecutorError::permanent("down")) }),
        );
        let h = harness(registry);
        let wf = WorkflowDefinition::new("wf").with_node(
            Node::action("A", "primary", "echo")
                .with_param("msg", "hi")
                .with_fallback(BUILTIN_SERVICE),
        );

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        let output = &state.outputs["A"];
        assert_eq!(output["msg"], json!("hi"));
        assert_eq!(output["fallback_used"], json!(true));
        assert_eq!(output["fallback_service"], json!("builtin"));
        assert!(output["original_error"].as_str().unwrap().contains("down"));
    }

    #[tokio::test]
    async fn test_output_schema_violation_fails_step() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf").with_node(
            echo("A")
                .with_param("id", "abc")
                .with_output_schema(json!({"type": "object", "properties": {"id": {"type": "integer"}}})),
        );

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
        let error = state.steps["A"].error.clone().unwrap();
        assert!(error.starts_with("output schema validation failed"), "{}", error);
        assert!(!state.outputs.contains_key("A"));
    }

    #[tokio::test]
    async fn test_input_schema_checked_before_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = harness(ExecutorRegistry::new().with("count", counting(calls.clone())));
        let wf = WorkflowDefinition::new("wf").with_node(
            Node::action("A", "count", "run")
                .with_input_schema(json!({"type": "object", "required": ["email"]})),
        );

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_trigger_outputs_input_data() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf")
            .with_node(Node::trigger("start"))
            .with_node(echo("greet").with_param("to", "${start.email}"))
            .connect("start", "greet");

        let state = h
            .engine
            .run(&wf, inputs(json!({"email": "a@b.com"})))
            .await
            .unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(state.outputs["start"], json!({"email": "a@b.com"}));
        assert_eq!(state.outputs["greet"], json!({"to": "a@b.com"}));
    }

    #[tokio::test]
    async fn test_branch_and_merge() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf")
            .with_node(echo("A").with_param("score", 7))
            .with_node(echo("high"))
            .with_node(echo("low"))
            .with_node(echo("done"))
            .connect_if("A", "high", "${A.score} >= 5")
            .connect_if("A", "low", "${A.score} < 5")
            .connect("high", "done")
            .connect("low", "done");

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.step_status("high"), StepStatus::Completed);
        assert_eq!(state.step_status("low"), StepStatus::Pending);
        // The merge waits for both branches
        assert_eq!(state.step_status("done"), StepStatus::Pending);
        assert_eq!(state.status, ExecutionStatus::Partial);
    }

    #[tokio::test]
    async fn test_condition_on_missing_field_does_not_activate() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf")
            .with_node(echo("A"))
            .with_node(echo("B"))
            .connect_if("A", "B", "${A.absent} != true");

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Partial);
        assert_eq!(state.step_status("B"), StepStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graph_concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        let tracked = FnExecutor::new(move |_, _| {
            let (running, peak) = (r.clone(), p.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                time::sleep(Duration::from_secs(1)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(json!({}))
            }
        });

        let mut h = harness(ExecutorRegistry::new().with("tracked", tracked));
        h.engine.set_max_concurrency(2);

        let mut wf = WorkflowDefinition::new("wf").with_node(echo("root").with_param("go", true));
        for i in 0..5 {
            let id = format!("branch{}", i);
            wf = wf
                .with_node(Node::action(&id, "tracked", "run"))
                .connect_if("root", &id, "${root.go}");
        }

        let started = time::Instant::now();
        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        // Five one-second steps two at a time
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_graph_branches_run_concurrently() {
        let sleeper = FnExecutor::new(|_, _| async {
            time::sleep(Duration::from_secs(1)).await;
            Ok(json!({}))
        });
        let h = harness(ExecutorRegistry::new().with("sleep", sleeper));
        let wf = WorkflowDefinition::new("wf")
            .with_node(echo("root"))
            .with_node(Node::action("a", "sleep", "run"))
            .with_node(Node::action("b", "sleep", "run"))
            .with_node(Node::action("c", "sleep", "run"))
            .connect_if("root", "a", "true")
            .connect("root", "b")
            .connect("root", "c");

        let started = time::Instant::now();
        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_huge_concurrency_is_clamped() {
        let mut h = harness(ExecutorRegistry::new());
        h.engine.set_max_concurrency(usize::MAX);
        assert_eq!(h.engine.config().max_concurrency, Semaphore::MAX_PERMITS);

        let wf = WorkflowDefinition::new("wf")
            .with_node(echo("A").with_param("go", true))
            .with_node(echo("B"))
            .with_node(echo("C"))
            .connect_if("A", "B", "${A.go}")
            .connect("A", "C");
        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);

        h.engine.set_max_concurrency(0);
        assert_eq!(h.engine.config().max_concurrency, 1);
    }

    #[tokio::test]
    async fn test_graph_failure_drains_round() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf")
            .with_node(echo("root"))
            .with_node(fail("bad", "boom"))
            .with_node(echo("good"))
            .with_node(echo("after"))
            .connect_if("root", "bad", "true")
            .connect("root", "good")
            .connect("good", "after");

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert_eq!(state.step_status("good"), StepStatus::Completed);
        // No new round after the failure
        assert_eq!(state.step_status("after"), StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_graph_failure_outranks_pause() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf")
            .with_node(echo("root"))
            .with_node(fail("bad", "boom"))
            .with_node(echo("waits").with_param("x", "${input.x}"))
            .connect_if("root", "bad", "true")
            .connect("root", "waits");

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert!(state.pause.is_none());
    }

    #[tokio::test]
    async fn test_graph_pause_stops_new_rounds() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf")
            .with_node(echo("root"))
            .with_node(echo("waits").with_param("x", "${input.x}"))
            .with_node(echo("sibling"))
            .with_node(echo("next"))
            .connect_if("root", "waits", "true")
            .connect("root", "sibling")
            .connect("sibling", "next");

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Paused);
        assert_eq!(state.step_status("next"), StepStatus::Pending);
        assert_eq!(state.pause.unwrap().missing_var, "input.x");
    }

    #[tokio::test]
    async fn test_notifications_and_analytics_on_success() {
        let h = harness(ExecutorRegistry::new());
        let mut wf = WorkflowDefinition::new("wf").with_node(echo("A"));
        wf.time_saved_seconds = 120.0;
        wf.business_value = 3.5;

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(
            h.notifier.events(),
            vec![
                ExecutionEvent::Running,
                ExecutionEvent::StepRunning,
                ExecutionEvent::StepCompleted,
                ExecutionEvent::Completed,
            ]
        );

        let runs = h.analytics.runs.lock().unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].success);
        assert_eq!(runs[0].workflow_id, "wf");
        assert_eq!(runs[0].time_saved_seconds, 120.0);
        assert_eq!(runs[0].business_value, 3.5);
    }

    #[tokio::test]
    async fn test_notifier_failure_does_not_abort() {
        let mut h = harness(ExecutorRegistry::new());
        h.engine.set_notifier(Arc::new(BrokenNotifier));
        let wf = WorkflowDefinition::new("wf").with_node(echo("A"));

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_invalid_workflow_is_rejected() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("wf")
            .with_node(echo("A"))
            .with_node(echo("B"))
            .connect("A", "B")
            .connect("B", "A");

        let err = h.engine.run(&wf, Map::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidWorkflow(_)));
    }

    #[tokio::test]
    async fn test_precomputed_steps_are_used() {
        let h = harness(ExecutorRegistry::new());
        let mut wf = WorkflowDefinition::new("wf")
            .with_node(echo("A"))
            .with_node(echo("B").with_param("x", "${A.v}"));
        wf.steps = Some(vec![echo("A").with_param("v", 2), echo("B").with_param("x", "${A.v}")]);

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(state.outputs["B"], json!({"x": 2}));
    }

    #[tokio::test]
    async fn test_sub_workflow_is_awaited() {
        let mut h = harness(ExecutorRegistry::new());
        let child = WorkflowDefinition::new("child")
            .with_node(echo("inner").with_param("greeting", "${input.name}"));
        h.engine
            .set_workflow_repository(Arc::new(InMemoryWorkflowRepository::from_workflows([child])));

        let wf = WorkflowDefinition::new("parent").with_node(
            Node::action("call", WORKFLOW_SERVICE, "run")
                .with_param("workflow_id", "child")
                .with_param("input", json!({"name": "${input.who}"})),
        );

        let state = h
            .engine
            .run(&wf, inputs(json!({"who": "ada"})))
            .await
            .unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        let output = &state.outputs["call"];
        assert_eq!(output["status"], json!("COMPLETED"));
        assert_eq!(output["outputs"]["inner"], json!({"greeting": "ada"}));
        assert_eq!(h.analytics.runs.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sub_workflow_failure_fails_step() {
        let mut h = harness(ExecutorRegistry::new());
        let child = WorkflowDefinition::new("child").with_node(fail("inner", "nope"));
        h.engine
            .set_workflow_repository(Arc::new(InMemoryWorkflowRepository::from_workflows([child])));

        let wf = WorkflowDefinition::new("parent").with_node(
            Node::action("call", WORKFLOW_SERVICE, "run").with_param("workflow_id", "child"),
        );

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
        let error = state.steps["call"].error.clone().unwrap();
        assert!(error.contains("sub-workflow 'child' ended FAILED"), "{}", error);
        assert!(error.contains("nope"), "{}", error);
    }

    #[tokio::test]
    async fn test_sub_workflow_depth_is_enforced() {
        let mut h = harness(ExecutorRegistry::new());
        let looping = WorkflowDefinition::new("loop").with_node(
            Node::action("call", WORKFLOW_SERVICE, "run").with_param("workflow_id", "loop"),
        );
        h.engine.set_workflow_repository(Arc::new(InMemoryWorkflowRepository::from_workflows([
            looping.clone(),
        ])));

        let state = h.engine.run(&looping, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
        let error = state.steps["call"].error.clone().unwrap();
        assert!(error.contains("depth limit of 3 exceeded"), "{}", error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_workflow_timeout_fails_child() {
        let mut h = harness(ExecutorRegistry::new().with("slow", hanging()));
        let child = WorkflowDefinition::new("child")
            .with_node(echo("first"))
            .with_node(Node::action("inner", "slow", "wait"))
            .connect("first", "inner");
        h.engine
            .set_workflow_repository(Arc::new(InMemoryWorkflowRepository::from_workflows([child])));

        let wf = WorkflowDefinition::new("parent").with_node(
            Node::action("call", WORKFLOW_SERVICE, "run")
                .with_param("workflow_id", "child")
                .with_timeout(1.0),
        );

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
        let error = state.steps["call"].error.clone().unwrap();
        assert!(error.contains("timed out after 1s"), "{}", error);

        let child_id = h.notifier.execution_of("child");
        let child = h.engine.store().get_execution_state(&child_id).await.unwrap();
        assert_eq!(child.status, ExecutionStatus::Failed);
        assert_eq!(child.step_status("first"), StepStatus::Completed);
        assert_eq!(child.step_status("inner"), StepStatus::Failed);
        assert!(child.steps_with_status(StepStatus::Running).is_empty());
        assert!(child.steps["inner"].error.as_deref().unwrap().contains("timed out"));

        let runs = h.analytics.runs.lock().unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|run| !run.success));
        assert!(runs.iter().any(|run| run.workflow_id == "child"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_workflow_timeout_fails_whole_chain() {
        let mut h = harness(ExecutorRegistry::new().with("slow", hanging()));
        let grandchild = WorkflowDefinition::new("grandchild")
            .with_node(Node::action("inner", "slow", "wait"));
        let child = WorkflowDefinition::new("child").with_node(
            Node::action("call", WORKFLOW_SERVICE, "run").with_param("workflow_id", "grandchild"),
        );
        h.engine.set_workflow_repository(Arc::new(InMemoryWorkflowRepository::from_workflows([
            child, grandchild,
        ])));

        let wf = WorkflowDefinition::new("parent").with_node(
            Node::action("call", WORKFLOW_SERVICE, "run")
                .with_param("workflow_id", "child")
                .with_timeout(1.0),
        );

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);

        // The innermost run is failed from a background task
        time::sleep(Duration::from_millis(10)).await;

        for workflow_id in ["child", "grandchild"] {
            let id = h.notifier.execution_of(workflow_id);
            let nested = h.engine.store().get_execution_state(&id).await.unwrap();
            assert_eq!(nested.status, ExecutionStatus::Failed, "{}", workflow_id);
            assert!(nested.steps_with_status(StepStatus::Running).is_empty());
        }
    }

    #[tokio::test]
    async fn test_sub_workflow_without_repository() {
        let h = harness(ExecutorRegistry::new());
        let wf = WorkflowDefinition::new("parent").with_node(
            Node::action("call", WORKFLOW_SERVICE, "run").with_param("workflow_id", "child"),
        );

        let state = h.engine.run(&wf, Map::new()).await.unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert!(state.steps["call"]
            .error
            .as_deref()
            .unwrap()
            .contains("no workflow repository"));
    }

    #[tokio::test]
    async fn test_pause_survives_restart_with_file_store() {
        let dir = tempdir().unwrap();
        let wf = WorkflowDefinition::new("wf")
            .with_node(echo("A").with_param("v", 1))
            .with_node(echo("B").with_param("to", "${input.email}"))
            .connect("A", "B");

        let execution_id = {
            let registry = ExecutorRegistry::new().with(BUILTIN_SERVICE, BuiltinExecutor);
            let engine = Engine::new(registry, Arc::new(FileStateStore::new(dir.path())));
            let state = engine.run(&wf, Map::new()).await.unwrap();
            assert_eq!(state.status, ExecutionStatus::Paused);
            state.execution_id
        };

        let registry = ExecutorRegistry::new().with(BUILTIN_SERVICE, BuiltinExecutor);
        let engine = Engine::new(registry, Arc::new(FileStateStore::new(dir.path())));
        let state = engine
            .resume(&wf, &execution_id, inputs(json!({"email": "a@b.com"})))
            .await
            .unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(state.outputs["A"], json!({"v": 1}));
        assert_eq!(state.outputs["B"], json!({"to": "a@b.com"}));
    }

    #[test]
    fn test_ready_steps_require_all_incoming() {
        let wf = WorkflowDefinition::new("wf")
            .with_node(echo("A"))
            .with_node(echo("B"))
            .with_node(echo("C"))
            .connect_if("A", "C", "true")
            .connect("B", "C");
        let graph = crate::workflow::graph::build_graph(&wf.nodes, &wf.connections);
        let state = ExecutionState::new("e", "wf", Map::new());

        let mut activated = HashSet::new();
        let ready: Vec<String> = ready_steps(&graph, &state, &activated)
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ready, vec!["A", "B"]);

        activated.insert(edge_key(&graph.incoming("C")[0]));
        assert!(ready_steps(&graph, &state, &activated)
            .iter()
            .all(|s| s.id != "C"));

        activated.insert(edge_key(&graph.incoming("C")[1]));
        assert!(ready_steps(&graph, &state, &activated)
            .iter()
            .any(|s| s.id == "C"));
    }
}
