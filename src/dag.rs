//! The pipeline executor: runs a task graph with conditional edges for a
//! configured number of iterations, launching independent ready tasks
//! concurrently and skipping tasks whose dependency conditions can no longer
//! be met.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use swarm_core::{
    ComposeFile, DepCondition, Dependency, Error, Pipeline, PromptSource, Result, TaskDefinition,
    TaskState, TaskStatus,
};

use crate::backend::BackendConfig;
use crate::paths;
use crate::runner::{Runner, RunnerOptions};
use crate::semaphore::NamedSemaphore;
use crate::store::StateStore;

/// Environment variable through which tasks find the per-iteration shared
/// directory.
pub const SHARED_DIR_ENV: &str = "SWARM_SHARED_DIR";

/// A validated task graph: the included definitions plus their edges,
/// filtered to targets inside the included set.
#[derive(Debug)]
pub struct Graph {
    tasks: BTreeMap<String, TaskDefinition>,
    deps: BTreeMap<String, Vec<Dependency>>,
}

impl Graph {
    /// Build and validate. Dependencies on tasks absent from the whole
    /// document are rejected; dependencies on tasks merely excluded from
    /// this run are dropped.
    pub fn build(
        all_tasks: &BTreeMap<String, TaskDefinition>,
        included: &[String],
    ) -> Result<Self> {
        let mut tasks = BTreeMap::new();
        for name in included {
            let def = all_tasks.get(name).ok_or_else(|| {
                Error::validation(format!("pipeline includes unknown task '{name}'"))
            })?;
            tasks.insert(name.clone(), def.clone());
        }

        let mut deps: BTreeMap<String, Vec<Dependency>> = BTreeMap::new();
        for (name, def) in &tasks {
            let mut edges = Vec::new();
            for dep in &def.depends_on {
                if dep.task == *name {
                    return Err(Error::validation(format!(
                        "task '{name}' depends on itself"
                    )));
                }
                if !all_tasks.contains_key(&dep.task) {
                    return Err(Error::validation(format!(
                        "task '{name}' depends on unknown task '{}'",
                        dep.task
                    )));
                }
                if tasks.contains_key(&dep.task) {
                    edges.push(dep.clone());
                }
            }
            deps.insert(name.clone(), edges);
        }

        let graph = Self { tasks, deps };
        if let Some(cycle) = graph.find_cycle() {
            return Err(Error::validation(format!(
                "dependency cycle: {}",
                cycle.join(" -> ")
            )));
        }
        Ok(graph)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &String> {
        self.tasks.keys()
    }

    fn deps_of(&self, name: &str) -> &[Dependency] {
        self.deps.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Three-colour DFS; a back-edge to an in-progress node closes a cycle,
    /// reported as the path around it.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Grey,
            Black,
        }

        fn visit(
            graph: &Graph,
            node: &str,
            colours: &mut BTreeMap<String, Colour>,
            path: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            colours.insert(node.to_string(), Colour::Grey);
            path.push(node.to_string());
            for dep in graph.deps_of(node) {
                match colours.get(&dep.task).copied().unwrap_or(Colour::White) {
                    Colour::Grey => {
                        let start = path.iter().position(|n| n == &dep.task).unwrap_or(0);
                        let mut cycle = path[start..].to_vec();
                        cycle.push(dep.task.clone());
                        return Some(cycle);
                    }
                    Colour::White => {
                        if let Some(cycle) = visit(graph, &dep.task, colours, path) {
                            return Some(cycle);
                        }
                    }
                    Colour::Black => {}
                }
            }
            path.pop();
            colours.insert(node.to_string(), Colour::Black);
            None
        }

        let mut colours = BTreeMap::new();
        for name in self.tasks.keys() {
            if colours.get(name).copied().unwrap_or(Colour::White) == Colour::White {
                let mut path = Vec::new();
                if let Some(cycle) = visit(self, name, &mut colours, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }
}

fn dep_ready(condition: DepCondition, status: TaskStatus) -> bool {
    match condition {
        DepCondition::Success => status == TaskStatus::Succeeded,
        DepCondition::Failure => status == TaskStatus::Failed,
        DepCondition::Any => matches!(status, TaskStatus::Succeeded | TaskStatus::Failed),
        DepCondition::Always => matches!(
            status,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped
        ),
    }
}

fn dep_unsatisfiable(condition: DepCondition, status: TaskStatus) -> bool {
    match condition {
        DepCondition::Success => matches!(status, TaskStatus::Failed | TaskStatus::Skipped),
        DepCondition::Failure => matches!(status, TaskStatus::Succeeded | TaskStatus::Skipped),
        DepCondition::Any | DepCondition::Always => false,
    }
}

/// One iteration's final task states.
#[derive(Clone, Debug)]
pub struct IterationSummary {
    pub index: u32,
    pub total: u32,
    pub states: BTreeMap<String, TaskState>,
}

impl IterationSummary {
    /// (succeeded, failed, skipped)
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for state in self.states.values() {
            match state.status {
                TaskStatus::Succeeded => counts.0 += 1,
                TaskStatus::Failed => counts.1 += 1,
                TaskStatus::Skipped => counts.2 += 1,
                _ => {}
            }
        }
        counts
    }
}

/// One pipeline instance's full run.
#[derive(Clone, Debug)]
pub struct PipelineRun {
    pub instance: u32,
    pub iterations: Vec<IterationSummary>,
}

pub struct Executor {
    store: Arc<StateStore>,
    backend: BackendConfig,
    working_dir: PathBuf,
    echo_output: bool,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(
        store: Arc<StateStore>,
        backend: BackendConfig,
        working_dir: PathBuf,
        echo_output: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            backend,
            working_dir,
            echo_output,
            cancel,
        }
    }

    /// Run one named pipeline of the compose document. Validation happens
    /// before anything spawns. With `instances > 1` the whole pipeline runs
    /// that many times concurrently, each instance with independent state
    /// and `#k`-suffixed agent names.
    pub async fn run(
        &self,
        compose: &ComposeFile,
        pipeline_name: &str,
        pipeline: &Pipeline,
    ) -> Result<Vec<PipelineRun>> {
        let included = compose.pipeline_tasks(pipeline);
        let graph = Graph::build(&compose.tasks, &included)?;

        if pipeline.instances <= 1 {
            let run = self.run_instance(&graph, pipeline, pipeline_name, 0).await?;
            return Ok(vec![run]);
        }

        let futures: Vec<_> = (1..=pipeline.instances)
            .map(|k| self.run_instance(&graph, pipeline, pipeline_name, k))
            .collect();
        let mut runs = Vec::new();
        for result in futures::future::join_all(futures).await {
            runs.push(result?);
        }
        Ok(runs)
    }

    async fn run_instance(
        &self,
        graph: &Graph,
        pipeline: &Pipeline,
        pipeline_name: &str,
        instance: u32,
    ) -> Result<PipelineRun> {
        let total = pipeline.iterations.max(1);
        let mut iterations = Vec::new();
        for index in 1..=total {
            if self.cancel.is_cancelled() {
                break;
            }
            info!(pipeline = pipeline_name, instance, "iteration {index}/{total}");
            let states = self
                .run_iteration(graph, pipeline, pipeline_name, instance, index)
                .await?;
            iterations.push(IterationSummary {
                index,
                total,
                states,
            });
        }
        Ok(PipelineRun {
            instance,
            iterations,
        })
    }

    async fn run_iteration(
        &self,
        graph: &Graph,
        pipeline: &Pipeline,
        pipeline_name: &str,
        instance: u32,
        iteration: u32,
    ) -> Result<BTreeMap<String, TaskState>> {
        // Fresh state every iteration: nothing leaks from iteration N to N+1.
        let mut states: BTreeMap<String, TaskState> = graph
            .task_names()
            .map(|name| (name.clone(), TaskState::pending(name.clone())))
            .collect();

        let run_tag = format!("{pipeline_name}-{instance}");
        let shared = paths::shared_dir(self.store.root(), &run_tag, iteration);
        std::fs::create_dir_all(&shared)?;

        let cap = pipeline.parallelism as usize;
        let (tx, mut rx) = mpsc::channel::<(String, bool, String)>(64);
        let mut running = 0usize;

        loop {
            // Skips cascade: a skipped dependency can doom its dependents.
            loop {
                let doomed: Vec<String> = states
                    .iter()
                    .filter(|(_, s)| s.status == TaskStatus::Pending)
                    .filter(|(name, _)| {
                        graph.deps_of(name).iter().any(|dep| {
                            dep_unsatisfiable(dep.condition, states[&dep.task].status)
                        })
                    })
                    .map(|(name, _)| name.clone())
                    .collect();
                if doomed.is_empty() {
                    break;
                }
                for name in doomed {
                    debug!(task = %name, "skipped: dependency unsatisfiable");
                    let state = states.get_mut(&name).expect("known task");
                    state.status = TaskStatus::Skipped;
                    state.completed_at = Some(Utc::now());
                }
            }

            if states.values().all(|s| s.status.is_terminal()) {
                break;
            }

            // BTreeMap order makes the ready set alphabetical, so ties break
            // deterministically.
            let ready: Vec<String> = states
                .iter()
                .filter(|(_, s)| s.status == TaskStatus::Pending)
                .filter(|(name, _)| {
                    graph
                        .deps_of(name)
                        .iter()
                        .all(|dep| dep_ready(dep.condition, states[&dep.task].status))
                })
                .map(|(name, _)| name.clone())
                .collect();

            for name in ready {
                if cap > 0 && running >= cap {
                    break;
                }
                let state = states.get_mut(&name).expect("known task");
                state.status = TaskStatus::Running;
                state.started_at = Some(Utc::now());
                running += 1;
                self.launch(&name, &graph.tasks[&name], instance, &shared, tx.clone());
            }

            if running == 0 {
                if states.values().any(|s| s.status == TaskStatus::Pending) {
                    // Validation guarantees progress; reaching here is a bug.
                    return Err(Error::internal(
                        "pipeline deadlocked with pending tasks and nothing running",
                    ));
                }
                continue;
            }

            // Wait for any running task to finish, then re-evaluate.
            let (name, succeeded, error) = rx
                .recv()
                .await
                .ok_or_else(|| Error::internal("task channel closed"))?;
            running -= 1;
            let state = states.get_mut(&name).expect("known task");
            state.status = if succeeded {
                TaskStatus::Succeeded
            } else {
                TaskStatus::Failed
            };
            state.completed_at = Some(Utc::now());
            state.error = error;
        }

        if let Err(e) = std::fs::remove_dir_all(&shared) {
            warn!(dir = %shared.display(), error = %e, "could not remove shared dir");
        }
        Ok(states)
    }

    fn launch(
        &self,
        task_name: &str,
        def: &TaskDefinition,
        instance: u32,
        shared: &std::path::Path,
        tx: mpsc::Sender<(String, bool, String)>,
    ) {
        let store = self.store.clone();
        let backend = self.backend.clone();
        let working_dir = self.working_dir.clone();
        let echo_output = self.echo_output;
        let cancel = self.cancel.clone();
        let sem_dir = paths::sem_dir(self.store.root());
        let task_name = task_name.to_string();
        let def = def.clone();
        let shared = shared.to_path_buf();

        tokio::spawn(async move {
            let outcome = run_task(
                store,
                backend,
                working_dir,
                echo_output,
                cancel,
                sem_dir,
                &task_name,
                &def,
                instance,
                &shared,
            )
            .await;
            let (succeeded, error) = match outcome {
                Ok(()) => (true, String::new()),
                Err(e) => (false, e.to_string()),
            };
            let _ = tx.send((task_name, succeeded, error)).await;
        });
    }
}

/// Run one task to completion: take the global concurrency permit, then run
/// the configured number of runner instances; the task is terminal when all
/// of them are, and fails if any of them failed.
#[allow(clippy::too_many_arguments)]
async fn run_task(
    store: Arc<StateStore>,
    backend: BackendConfig,
    working_dir: PathBuf,
    echo_output: bool,
    cancel: CancellationToken,
    sem_dir: PathBuf,
    task_name: &str,
    def: &TaskDefinition,
    instance: u32,
    shared: &std::path::Path,
) -> Result<()> {
    let semaphore = NamedSemaphore::new(sem_dir, task_name, def.concurrency.unwrap_or(0));
    let _permit = semaphore.acquire().await?;

    let prompt = resolve_prompt(def)?;
    let base_name = def.name.clone().unwrap_or_else(|| task_name.to_string());
    let agent_name = if instance > 0 {
        format!("{base_name}#{instance}")
    } else {
        base_name
    };

    let fanout = def.parallelism.unwrap_or(1).max(1);
    let mut futures = Vec::new();
    for _ in 0..fanout {
        let opts = RunnerOptions {
            name: agent_name.clone(),
            labels: def.labels.clone(),
            prompt: prompt.clone(),
            model: def.model.clone().unwrap_or_default(),
            iterations: def.iterations.unwrap_or(1),
            working_dir: working_dir.clone(),
            extra_env: vec![(
                SHARED_DIR_ENV.to_string(),
                shared.to_string_lossy().into_owned(),
            )],
            backend: backend.clone(),
            echo_output,
            ..RunnerOptions::default()
        };
        let runner = Runner::register(store.clone(), opts)?.with_cancel(cancel.child_token());
        futures.push(runner.run());
    }

    let mut failure: Option<Error> = None;
    for result in futures::future::join_all(futures).await {
        let record = result?;
        let clean = record.exit_reason == Some(swarm_core::ExitReason::Completed)
            && record.failed_iterations == 0;
        if !clean && failure.is_none() {
            failure = Some(Error::ChildFailed {
                code: 1,
                stderr: if record.last_error.is_empty() {
                    format!(
                        "agent {} ended {}",
                        record.id,
                        record
                            .exit_reason
                            .map(|r| r.to_string())
                            .unwrap_or_else(|| "abnormally".into())
                    )
                } else {
                    record.last_error.clone()
                },
            });
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// The prompt handed to the backend: identifier, file path, or inline string,
/// wrapped in the task's prefix/suffix text.
fn resolve_prompt(def: &TaskDefinition) -> Result<String> {
    let core = match def.prompt_source()? {
        PromptSource::Named(s) | PromptSource::File(s) | PromptSource::Inline(s) => s,
    };
    let mut prompt = String::new();
    if let Some(prefix) = &def.prefix {
        prompt.push_str(prefix);
    }
    prompt.push_str(&core);
    if let Some(suffix) = &def.suffix {
        prompt.push_str(suffix);
    }
    Ok(prompt)
}
