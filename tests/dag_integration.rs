//! End-to-end pipeline scenarios with shell-command tasks.

#![cfg(unix)]

use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use swarm::backend::BackendConfig;
use swarm::dag::Executor;
use swarm::store::{Scope, StateStore};
use swarm_core::{ComposeFile, TaskStatus};

/// Backend that executes each task's prompt as a shell command.
fn sh_backend() -> BackendConfig {
    BackendConfig {
        executable: "sh".into(),
        args: vec!["-c".into(), "{prompt}".into()],
        raw_output: true,
    }
}

fn executor(dir: &TempDir) -> (Arc<StateStore>, Executor) {
    let store = Arc::new(StateStore::open_at(dir.path(), Scope::Global).unwrap());
    let exec = Executor::new(
        store.clone(),
        sh_backend(),
        dir.path().to_path_buf(),
        false,
        CancellationToken::new(),
    );
    (store, exec)
}

async fn run(
    exec: &Executor,
    compose: &ComposeFile,
    pipeline: &str,
) -> Vec<swarm::dag::PipelineRun> {
    let p = compose.pipelines[pipeline].clone();
    exec.run(compose, pipeline, &p).await.unwrap()
}

#[tokio::test]
async fn linear_chain_runs_in_dependency_order() {
    let compose = ComposeFile::parse(
        r#"
[tasks.a]
prompt-string = "echo a"
[tasks.b]
prompt-string = "echo b"
depends_on = ["a"]
[tasks.c]
prompt-string = "echo c"
depends_on = ["b"]
[pipelines.main]
"#,
    )
    .unwrap();
    let dir = TempDir::new().unwrap();
    let (_store, exec) = executor(&dir);

    let runs = run(&exec, &compose, "main").await;
    assert_eq!(runs.len(), 1);
    let iteration = &runs[0].iterations[0];
    let (succeeded, failed, skipped) = iteration.counts();
    assert_eq!((succeeded, failed, skipped), (3, 0, 0));

    let a = &iteration.states["a"];
    let b = &iteration.states["b"];
    let c = &iteration.states["c"];
    assert!(a.started_at.unwrap() < b.started_at.unwrap());
    assert!(b.started_at.unwrap() < c.started_at.unwrap());
    // Topological ordering: an edge's source completes before its target starts.
    assert!(a.completed_at.unwrap() <= b.started_at.unwrap());
    assert!(b.completed_at.unwrap() <= c.started_at.unwrap());
}

#[tokio::test]
async fn pipeline_iterations_reset_state_each_round() {
    let compose = ComposeFile::parse(
        r#"
[tasks.step1]
prompt-string = "true"
[tasks.step2]
prompt-string = "true"
depends_on = ["step1"]
[pipelines.main]
iterations = 3
"#,
    )
    .unwrap();
    let dir = TempDir::new().unwrap();
    let (_store, exec) = executor(&dir);

    let runs = run(&exec, &compose, "main").await;
    assert_eq!(runs[0].iterations.len(), 3);
    for (i, iteration) in runs[0].iterations.iter().enumerate() {
        assert_eq!(iteration.index as usize, i + 1);
        assert_eq!(iteration.total, 3);
        assert_eq!(iteration.counts(), (2, 0, 0));
    }
}

#[tokio::test]
async fn conditional_edges_skip_and_fire_on_failure() {
    let compose = ComposeFile::parse(
        r#"
[tasks.failing]
prompt-string = "exit 1"
[tasks.on_success]
prompt-string = "true"
depends_on = [{ task = "failing", condition = "success" }]
[tasks.on_failure]
prompt-string = "exit 1"
depends_on = [{ task = "failing", condition = "failure" }]
[pipelines.main]
"#,
    )
    .unwrap();
    let dir = TempDir::new().unwrap();
    let (_store, exec) = executor(&dir);

    let runs = run(&exec, &compose, "main").await;
    let iteration = &runs[0].iterations[0];
    assert_eq!(iteration.states["failing"].status, TaskStatus::Failed);
    assert_eq!(iteration.states["on_success"].status, TaskStatus::Skipped);
    assert_eq!(iteration.states["on_failure"].status, TaskStatus::Failed);
    assert_eq!(iteration.counts(), (0, 2, 1));
}

#[tokio::test]
async fn cycles_are_rejected_before_anything_spawns() {
    let compose = ComposeFile::parse(
        r#"
[tasks.a]
prompt-string = "true"
depends_on = ["b"]
[tasks.b]
prompt-string = "true"
depends_on = ["a"]
[pipelines.main]
"#,
    )
    .unwrap();
    let dir = TempDir::new().unwrap();
    let (store, exec) = executor(&dir);

    let p = compose.pipelines["main"].clone();
    let err = exec.run(&compose, "main", &p).await.unwrap_err();
    assert!(err.to_string().contains("cycle"));
    assert!(store.list(false).unwrap().is_empty());
}

#[tokio::test]
async fn fan_out_runs_concurrently_and_joins() {
    let compose = ComposeFile::parse(
        r#"
[tasks.root]
prompt-string = "true"
[tasks.a]
prompt-string = "sleep 0.3"
depends_on = ["root"]
[tasks.b]
prompt-string = "sleep 0.3"
depends_on = ["root"]
[tasks.c]
prompt-string = "sleep 0.3"
depends_on = ["root"]
[tasks.final]
prompt-string = "true"
depends_on = ["a", "b", "c"]
[pipelines.main]
parallelism = 3
"#,
    )
    .unwrap();
    let dir = TempDir::new().unwrap();
    let (_store, exec) = executor(&dir);

    let runs = run(&exec, &compose, "main").await;
    let iteration = &runs[0].iterations[0];
    assert_eq!(iteration.counts(), (5, 0, 0));

    let states = &iteration.states;
    let started: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|t| states[*t].started_at.unwrap())
        .collect();
    let completed: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|t| states[*t].completed_at.unwrap())
        .collect();
    // All three overlapped at some instant.
    assert!(started.iter().max().unwrap() < completed.iter().min().unwrap());
    // And the join waited for the slowest.
    assert!(states["final"].started_at.unwrap() >= *completed.iter().max().unwrap());
}

#[tokio::test]
async fn parallelism_cap_serialises_independent_tasks() {
    let compose = ComposeFile::parse(
        r#"
[tasks.a]
prompt-string = "sleep 0.2"
[tasks.b]
prompt-string = "sleep 0.2"
[pipelines.main]
parallelism = 1
"#,
    )
    .unwrap();
    let dir = TempDir::new().unwrap();
    let (_store, exec) = executor(&dir);

    let runs = run(&exec, &compose, "main").await;
    let states = &runs[0].iterations[0].states;
    assert_eq!(runs[0].iterations[0].counts(), (2, 0, 0));
    // With one slot, alphabetical tie-break runs a strictly before b.
    assert!(states["a"].completed_at.unwrap() <= states["b"].started_at.unwrap());
}

#[tokio::test]
async fn empty_task_set_is_a_successful_noop() {
    let compose = ComposeFile::parse("[pipelines.main]\n").unwrap();
    let dir = TempDir::new().unwrap();
    let (_store, exec) = executor(&dir);

    let runs = run(&exec, &compose, "main").await;
    assert_eq!(runs[0].iterations.len(), 1);
    assert_eq!(runs[0].iterations[0].counts(), (0, 0, 0));
}

#[tokio::test]
async fn task_level_parallelism_spawns_multiple_agents() {
    let compose = ComposeFile::parse(
        r#"
[tasks.fan]
prompt-string = "true"
parallelism = 3
[pipelines.main]
"#,
    )
    .unwrap();
    let dir = TempDir::new().unwrap();
    let (store, exec) = executor(&dir);

    let runs = run(&exec, &compose, "main").await;
    assert_eq!(runs[0].iterations[0].counts(), (1, 0, 0));
    // Three runner instances were registered for the one task.
    let agents = store.list(false).unwrap();
    assert_eq!(agents.len(), 3);
    assert!(agents.iter().all(|a| a.name.starts_with("fan")));
}

#[tokio::test]
async fn pipeline_instances_run_independently_with_suffixed_names() {
    let compose = ComposeFile::parse(
        r#"
[tasks.solo]
prompt-string = "true"
[pipelines.main]
instances = 2
"#,
    )
    .unwrap();
    let dir = TempDir::new().unwrap();
    let (store, exec) = executor(&dir);

    let runs = run(&exec, &compose, "main").await;
    assert_eq!(runs.len(), 2);
    for run in &runs {
        assert_eq!(run.iterations[0].counts(), (1, 0, 0));
    }
    let names: Vec<String> = store
        .list(false)
        .unwrap()
        .into_iter()
        .map(|a| a.name)
        .collect();
    assert!(names.contains(&"solo#1".to_string()));
    assert!(names.contains(&"solo#2".to_string()));
}

#[tokio::test]
async fn shared_directory_is_visible_to_tasks_and_torn_down() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("observed");
    let compose = ComposeFile::parse(&format!(
        r#"
[tasks.writer]
prompt-string = "echo $SWARM_SHARED_DIR > {}; test -d \"$SWARM_SHARED_DIR\""
[pipelines.main]
"#,
        marker.display()
    ))
    .unwrap();
    let (_store, exec) = executor(&dir);

    let runs = run(&exec, &compose, "main").await;
    assert_eq!(runs[0].iterations[0].counts(), (1, 0, 0));
    let shared = std::fs::read_to_string(&marker).unwrap();
    let shared = shared.trim();
    assert!(!shared.is_empty());
    // Torn down after the iteration.
    assert!(!std::path::Path::new(shared).exists());
}
