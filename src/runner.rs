//! The per-agent supervision loop.
//!
//! A runner owns one agent record from registration to terminal status: it
//! spawns the backend child once per iteration, streams its stdout through
//! the log parser into the log file, enforces the total and per-iteration
//! deadlines, and re-reads the control fields from the store at every
//! iteration boundary. External `kill`/`stop`/`pause`/`set` commands work
//! purely by mutating those fields.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use swarm_core::{
    AgentRecord, AgentStatus, Error, ExitReason, Result, TerminateMode, TimeoutReason, UsageStats,
};

use crate::backend::BackendConfig;
use crate::parser::LogParser;
use crate::proc;
use crate::store::StateStore;

const PAUSE_POLL: Duration = Duration::from_secs(1);
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(500);
const STORE_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Stand-in deadline when no timeout is armed.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);
/// How much trailing stderr is kept for `last_error`.
const STDERR_TAIL_BYTES: usize = 2048;

/// Fresh 8-hex-char agent id.
pub fn new_agent_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub struct RunnerOptions {
    pub name: String,
    pub parent_id: Option<String>,
    pub labels: HashMap<String, String>,
    pub prompt: String,
    pub model: String,
    /// 0 means unlimited.
    pub iterations: u32,
    pub working_dir: PathBuf,
    /// Environment variable names forwarded to the backend; values are read
    /// live at each spawn and never persisted.
    pub env_names: Vec<String>,
    /// Extra engine-supplied variables (for example the shared pipeline
    /// directory).
    pub extra_env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub iteration_timeout: Option<Duration>,
    pub on_complete: String,
    pub backend: BackendConfig,
    /// Mirror parsed output to this process's stdout.
    pub echo_output: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            parent_id: None,
            labels: HashMap::new(),
            prompt: String::new(),
            model: String::new(),
            iterations: 1,
            working_dir: PathBuf::from("."),
            env_names: Vec::new(),
            extra_env: Vec::new(),
            timeout: None,
            iteration_timeout: None,
            on_complete: String::new(),
            backend: BackendConfig::default(),
            echo_output: false,
        }
    }
}

pub struct Runner {
    store: Arc<StateStore>,
    record: AgentRecord,
    opts: RunnerOptions,
    cancel: CancellationToken,
}

impl Runner {
    /// Register a fresh record (name suffixed on collision) and build the
    /// runner around it.
    pub fn register(store: Arc<StateStore>, opts: RunnerOptions) -> Result<Self> {
        let id = new_agent_id();
        let mut record = AgentRecord::new(&id);
        record.name = opts.name.clone();
        record.parent_id = opts.parent_id.clone();
        record.labels = opts.labels.clone();
        record.prompt = opts.prompt.clone();
        record.model = opts.model.clone();
        record.iterations = opts.iterations;
        record.working_dir = opts.working_dir.to_string_lossy().into_owned();
        record.env_names = opts.env_names.clone();
        record.log_file = store.log_file(&id).to_string_lossy().into_owned();
        record.on_complete = opts.on_complete.clone();
        if let Some(timeout) = opts.timeout {
            if let Ok(delta) = chrono::Duration::from_std(timeout) {
                record.timeout_at = Some(record.started_at + delta);
            }
        }
        let record = store.register(record)?;
        Ok(Self {
            store,
            record,
            opts,
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn record(&self) -> &AgentRecord {
        &self.record
    }

    /// Cancelling this token is equivalent to `terminate_mode = immediate`:
    /// the child group is killed and the run exits as `killed`.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Tie this runner's cancellation to an external token (the executor
    /// hands each task a child token of the pipeline's).
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Drive the iteration loop to a terminal state and return the final
    /// record. Run-scoped errors (cancellation, the total deadline) surface
    /// from the loop as [`Error::Cancelled`] / [`Error::Timeout`] and map
    /// onto the record's exit reason here.
    pub async fn run(mut self) -> Result<AgentRecord> {
        info!(id = %self.record.id, name = %self.record.name, "agent started");
        let reason = match self.iteration_loop().await {
            Ok(reason) => reason,
            Err(Error::Cancelled) => ExitReason::Killed,
            Err(Error::Timeout(_)) => ExitReason::Timeout,
            Err(e) => {
                warn!(id = %self.record.id, error = %e, "run aborted");
                self.record.last_error = e.to_string();
                ExitReason::Error
            }
        };
        self.finish(reason).await;
        Ok(self.record)
    }

    /// Iteration-scoped failures are absorbed here (counted, loop continues);
    /// only run-scoped conditions escape as errors.
    async fn iteration_loop(&mut self) -> Result<ExitReason> {
        loop {
            // Iteration boundary: adopt whatever control intent other
            // processes wrote while we were busy.
            self.sync_control();

            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.record.terminate_mode {
                Some(TerminateMode::Immediate) => return Ok(ExitReason::Killed),
                Some(TerminateMode::AfterIteration) if self.record.current_iteration > 0 => {
                    return Ok(ExitReason::Killed);
                }
                _ => {}
            }
            if self.record.paused {
                if let Some(reason) = self.wait_while_paused().await? {
                    return Ok(reason);
                }
            }
            if self.record.iterations > 0 && self.record.current_iteration >= self.record.iterations
            {
                return Ok(ExitReason::Completed);
            }
            if let Some(deadline) = self.record.timeout_at {
                if Utc::now() >= deadline {
                    self.record.timeout_reason = Some(TimeoutReason::Total);
                    return Err(Error::Timeout("total runtime limit reached".into()));
                }
            }

            self.run_iteration().await?;
        }
    }

    /// Copy the externally writable fields from disk into our working copy.
    /// This is the only channel through which outside commands steer a
    /// running agent.
    fn sync_control(&mut self) {
        match self.store.get(&self.record.id) {
            Ok(disk) => {
                self.record.iterations = disk.iterations;
                self.record.model = disk.model;
                self.record.terminate_mode = disk.terminate_mode;
                self.record.paused = disk.paused;
                self.record.paused_at = disk.paused_at;
            }
            Err(e) => warn!(id = %self.record.id, error = %e, "control re-read failed"),
        }
    }

    /// Block until unpaused; `Ok(None)` means resumed. Termination intent and
    /// the total deadline still apply while paused.
    async fn wait_while_paused(&mut self) -> Result<Option<ExitReason>> {
        debug!(id = %self.record.id, "paused");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(PAUSE_POLL) => {}
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            }
            self.sync_control();
            if matches!(self.record.terminate_mode, Some(_)) {
                return Ok(Some(ExitReason::Killed));
            }
            if let Some(deadline) = self.record.timeout_at {
                if Utc::now() >= deadline {
                    self.record.timeout_reason = Some(TimeoutReason::Total);
                    return Err(Error::Timeout("total runtime limit reached".into()));
                }
            }
            if !self.record.paused {
                debug!(id = %self.record.id, "resumed");
                return Ok(None);
            }
        }
    }

    async fn run_iteration(&mut self) -> Result<()> {
        let env = self.resolve_env();
        let mut cmd = self.opts.backend.command(
            &self.record.model,
            &self.record.prompt,
            &self.opts.working_dir,
            &env,
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = Error::spawn_failed(format!("{}: {e}", self.opts.backend.executable));
                self.record.current_iteration += 1;
                self.record.failed_iterations += 1;
                self.record.last_error = err.to_string();
                warn!(id = %self.record.id, error = %err, "spawn failed");
                self.write_state().await;
                tokio::time::sleep(SPAWN_RETRY_DELAY).await;
                return Ok(());
            }
        };

        self.record.current_iteration += 1;
        self.record.pid = child.id().unwrap_or(0);
        let child_pid = self.record.pid;
        debug!(id = %self.record.id, pid = child_pid,
               iteration = self.record.current_iteration, "iteration started");
        self.write_state().await;

        // Trailing stderr, for last_error on failure. The full stream also
        // lands in the log file.
        let stderr_tail: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = stderr_tail.clone();
            let log_path = PathBuf::from(&self.record.log_file);
            tokio::spawn(async move {
                let mut log = open_log(&log_path);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(log) = log.as_mut() {
                        let _ = writeln!(log, "{line}");
                    }
                    let mut tail = tail.lock().unwrap_or_else(|p| p.into_inner());
                    tail.push_str(&line);
                    tail.push('\n');
                    if tail.len() > STDERR_TAIL_BYTES {
                        let cut = tail.len() - STDERR_TAIL_BYTES;
                        tail.drain(..cut);
                    }
                }
            })
        });

        // Two deadlines race the iteration: the per-iteration cap and the
        // run-wide one.
        let iter_deadline =
            Instant::now() + self.opts.iteration_timeout.unwrap_or(FAR_FUTURE);
        let total_deadline = Instant::now()
            + self
                .record
                .timeout_at
                .map(|t| (t - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(FAR_FUTURE);

        let mut timed_out = false;
        let mut total_timeout = false;
        let mut cancelled = false;

        // Stream stdout: tee every line to the log file, and through the
        // parser unless the backend is in raw mode.
        let mut log = open_log(&PathBuf::from(&self.record.log_file));
        let sink: Box<dyn std::io::Write + Send> = if self.opts.echo_output {
            Box::new(std::io::stdout())
        } else {
            Box::new(std::io::sink())
        };
        let mut parser = LogParser::new(sink);
        let token_base = (
            self.record.input_tokens,
            self.record.output_tokens,
            self.record.total_cost_usd,
        );
        let mut synced = UsageStats::default();

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    next = lines.next_line() => match next {
                        Ok(Some(line)) => {
                            if let Some(log) = log.as_mut() {
                                let _ = writeln!(log, "{line}");
                            }
                            if self.opts.backend.raw_output {
                                if self.opts.echo_output {
                                    println!("{line}");
                                }
                            } else {
                                parser.process(&line);
                                if parser.stats() != &synced {
                                    synced = parser.stats().clone();
                                    self.record.input_tokens = token_base.0 + synced.input_tokens;
                                    self.record.output_tokens = token_base.1 + synced.output_tokens;
                                    if synced.total_cost_usd > 0.0 {
                                        self.record.total_cost_usd =
                                            token_base.2 + synced.total_cost_usd;
                                    }
                                    self.record.current_task = synced.current_task.clone();
                                    self.write_state().await;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(id = %self.record.id, error = %e, "stdout read error");
                            break;
                        }
                    },
                    _ = tokio::time::sleep_until(iter_deadline) => {
                        timed_out = true;
                        kill_child(&mut child, child_pid).await;
                        break;
                    }
                    _ = tokio::time::sleep_until(total_deadline) => {
                        total_timeout = true;
                        kill_child(&mut child, child_pid).await;
                        break;
                    }
                    _ = self.cancel.cancelled() => {
                        cancelled = true;
                        kill_child(&mut child, child_pid).await;
                        break;
                    }
                }
            }
        }
        parser.finish();

        // Reap, still racing the deadlines in case the child ignores EOF.
        let status = tokio::select! {
            status = child.wait() => status.ok(),
            _ = tokio::time::sleep_until(iter_deadline), if !timed_out && !cancelled && !total_timeout => {
                timed_out = true;
                kill_child(&mut child, child_pid).await;
                child.wait().await.ok()
            }
            _ = tokio::time::sleep_until(total_deadline), if !timed_out && !cancelled && !total_timeout => {
                total_timeout = true;
                kill_child(&mut child, child_pid).await;
                child.wait().await.ok()
            }
            _ = self.cancel.cancelled(), if !timed_out && !cancelled && !total_timeout => {
                cancelled = true;
                kill_child(&mut child, child_pid).await;
                child.wait().await.ok()
            }
        };
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        if cancelled {
            self.write_state().await;
            return Err(Error::Cancelled);
        }
        if total_timeout {
            self.record.timeout_reason = Some(TimeoutReason::Total);
            self.write_state().await;
            return Err(Error::Timeout("total runtime limit reached".into()));
        }

        if timed_out {
            self.record.failed_iterations += 1;
            self.record.timeout_reason = Some(TimeoutReason::Iteration);
            self.record.last_error = format!(
                "iteration {} timed out",
                self.record.current_iteration
            );
            warn!(id = %self.record.id, iteration = self.record.current_iteration,
                  "iteration timed out");
        } else {
            match status {
                Some(st) if st.success() => {
                    self.record.successful_iterations += 1;
                    self.record.last_error.clear();
                    debug!(id = %self.record.id,
                           iteration = self.record.current_iteration, "iteration succeeded");
                }
                other => {
                    self.record.failed_iterations += 1;
                    let tail = stderr_tail.lock().unwrap_or_else(|p| p.into_inner());
                    let tail = tail.trim();
                    self.record.last_error = if tail.is_empty() {
                        match other {
                            Some(st) => format!("backend exited with {st}"),
                            None => "backend exited abnormally".to_string(),
                        }
                    } else {
                        tail.to_string()
                    };
                    // A failed iteration never ends the run on its own.
                    warn!(id = %self.record.id, iteration = self.record.current_iteration,
                          error = %self.record.last_error, "iteration failed");
                }
            }
        }

        self.write_state().await;
        Ok(())
    }

    fn resolve_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .record
            .env_names
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
            .collect();
        env.extend(self.opts.extra_env.iter().cloned());
        env
    }

    /// Merge-write the record; one retry, then carry on with stale state.
    /// The store's next open reconciles if we die before a later write lands.
    async fn write_state(&mut self) {
        if self.store.merge_update(&mut self.record).is_ok() {
            return;
        }
        tokio::time::sleep(STORE_RETRY_DELAY).await;
        if let Err(e) = self.store.merge_update(&mut self.record) {
            warn!(id = %self.record.id, error = %e, "state write failed twice, continuing");
        }
    }

    async fn finish(&mut self, reason: ExitReason) {
        self.record.status = AgentStatus::Terminated;
        self.record.exit_reason = Some(reason);
        self.record.terminated_at = Some(Utc::now());
        self.record.paused = false;
        self.record.paused_at = None;
        // The terminal write must not resurrect paused/terminate intent, so
        // bypass the merge and replace outright.
        if self.store.update(&self.record).is_err() {
            tokio::time::sleep(STORE_RETRY_DELAY).await;
            if let Err(e) = self.store.update(&self.record) {
                warn!(id = %self.record.id, error = %e, "terminal state write failed");
            }
        }
        info!(id = %self.record.id, reason = %reason,
              successful = self.record.successful_iterations,
              failed = self.record.failed_iterations, "agent terminated");
        self.run_on_complete().await;
    }

    /// Fire the on-complete hook through the platform shell. Failures are
    /// logged and do not alter the terminal state.
    async fn run_on_complete(&self) {
        if self.record.on_complete.is_empty() {
            return;
        }
        let rec = &self.record;
        let reason = rec
            .exit_reason
            .map(|r| r.to_string())
            .unwrap_or_default();

        let mut cmd = if cfg!(windows) {
            let mut c = tokio::process::Command::new("cmd");
            c.arg("/C").arg(&rec.on_complete);
            c
        } else {
            let mut c = tokio::process::Command::new("sh");
            c.arg("-c").arg(&rec.on_complete);
            c
        };
        cmd.env("SWARM_AGENT_ID", &rec.id)
            .env("SWARM_AGENT_NAME", &rec.name)
            .env("SWARM_AGENT_STATUS", rec.status.to_string())
            .env("SWARM_AGENT_ITERATIONS", rec.iterations.to_string())
            .env("SWARM_AGENT_COMPLETED", rec.current_iteration.to_string())
            .env("SWARM_AGENT_PROMPT", &rec.prompt)
            .env("SWARM_AGENT_MODEL", &rec.model)
            .env("SWARM_AGENT_LOG_FILE", &rec.log_file)
            .env("SWARM_AGENT_DURATION", rec.duration_secs().to_string())
            .env("SWARM_AGENT_EXIT_REASON", reason)
            .env(
                "SWARM_AGENT_SUCCESSFUL_ITERS",
                rec.successful_iterations.to_string(),
            )
            .env("SWARM_AGENT_FAILED_ITERS", rec.failed_iterations.to_string());

        match cmd.status().await {
            Ok(status) if status.success() => {
                debug!(id = %rec.id, "on-complete hook finished");
            }
            Ok(status) => warn!(id = %rec.id, %status, "on-complete hook failed"),
            Err(e) => warn!(id = %rec.id, error = %e, "on-complete hook did not start"),
        }
    }
}

/// SIGKILL the child's process group; plain kill where groups don't exist.
async fn kill_child(child: &mut tokio::process::Child, pid: u32) {
    if cfg!(unix) && pid != 0 {
        proc::kill_group(pid);
    } else {
        let _ = child.kill().await;
    }
}

fn open_log(path: &PathBuf) -> Option<std::fs::File> {
    match std::fs::OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open log file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_ids_are_short_hex() {
        let id = new_agent_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn default_options_are_single_iteration() {
        let opts = RunnerOptions::default();
        assert_eq!(opts.iterations, 1);
        assert!(opts.timeout.is_none());
    }
}
