//! The shared agent registry: one JSON document per host, guarded by a
//! process mutex and an advisory exclusive lock on a sibling file.
//!
//! Every operation is a lock-read-mutate-write-unlock cycle. The file is the
//! coordination bus between runners and the short-lived CLI processes that
//! inspect or retarget them, so all returned records are owned copies and
//! mutating operations are single-field or merge-aware to avoid clobbering
//! concurrent writers.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use swarm_core::{AgentRecord, AgentStatus, Error, ExitReason, Result, TerminateMode};

use crate::paths;
use crate::proc;

/// Grace period before a registered-but-never-spawned record (pid 0) is
/// declared crashed by the open-time sweep.
const STARTUP_GRACE_SECS: i64 = 30;

/// Listing scope. Point lookups by id or name are always cross-scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    Global,
    Project { working_dir: String },
}

impl Scope {
    pub fn project(working_dir: impl Into<String>) -> Self {
        Self::Project {
            working_dir: working_dir.into(),
        }
    }

    fn matches(&self, record: &AgentRecord) -> bool {
        match self {
            Self::Global => true,
            Self::Project { working_dir } => record.working_dir == *working_dir,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDoc {
    #[serde(default)]
    agents: HashMap<String, AgentRecord>,
}

struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

pub struct StateStore {
    root: PathBuf,
    scope: Scope,
    // Serialises access within this process; the file lock serialises across
    // processes. Writers and readers hold both.
    mutex: Mutex<()>,
}

impl StateStore {
    /// Open the host-wide store at `<home>/.swarm` and run the crash sweep.
    pub fn open(scope: Scope) -> Result<Self> {
        Self::open_at(paths::swarm_home(), scope)
    }

    /// Open a store rooted at an explicit directory. Tests use this with a
    /// temp dir; everything else goes through [`StateStore::open`].
    pub fn open_at(root: impl Into<PathBuf>, scope: Scope) -> Result<Self> {
        let root = root.into();
        paths::ensure_layout(&root)?;
        let store = Self {
            root,
            scope,
            mutex: Mutex::new(()),
        };
        store.cleanup()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn log_file(&self, id: &str) -> PathBuf {
        paths::log_file(&self.root, id)
    }

    fn acquire(&self) -> Result<LockGuard> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(paths::lock_file(&self.root))
            .map_err(|e| Error::LockAcquireFailed(e.to_string()))?;
        file.lock_exclusive()
            .map_err(|e| Error::LockAcquireFailed(e.to_string()))?;
        Ok(LockGuard { file })
    }

    fn read_doc(&self) -> StateDoc {
        match std::fs::read_to_string(paths::state_file(&self.root)) {
            // A corrupt state file is treated as empty rather than fatal.
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                warn!(error = %e, "state file corrupt, treating as empty");
                StateDoc::default()
            }),
            Err(_) => StateDoc::default(),
        }
    }

    fn write_doc(&self, doc: &StateDoc) -> Result<()> {
        let path = paths::state_file(&self.root);
        let json = serde_json::to_string_pretty(doc)?;
        std::fs::write(&path, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))?;
        }
        Ok(())
    }

    /// Run `f` under both locks. `f` returns the result and whether the
    /// document changed and must be rewritten.
    fn with_doc<T>(&self, f: impl FnOnce(&mut StateDoc) -> Result<(T, bool)>) -> Result<T> {
        let _process = self
            .mutex
            .lock()
            .map_err(|_| Error::internal("state mutex poisoned"))?;
        let _file = self.acquire()?;
        let mut doc = self.read_doc();
        let (out, dirty) = f(&mut doc)?;
        if dirty {
            self.write_doc(&doc)?;
        }
        Ok(out)
    }

    /// Insert a new record. Running agents reserve their names: on collision
    /// the lowest free `-N` suffix (from 2) is appended. Returns the record
    /// as stored.
    pub fn register(&self, mut record: AgentRecord) -> Result<AgentRecord> {
        self.with_doc(|doc| {
            if !record.name.is_empty() {
                record.name = free_name(doc, &record.name);
            }
            let stored = record.clone();
            doc.agents.insert(record.id.clone(), record);
            Ok((stored, true))
        })
    }

    pub fn get(&self, id: &str) -> Result<AgentRecord> {
        self.with_doc(|doc| {
            let rec = doc
                .agents
                .get(id)
                .cloned()
                .ok_or_else(|| Error::RecordNotFound(id.to_string()))?;
            Ok((rec, false))
        })
    }

    /// Resolve an identifier as an id first, then as a name. Among several
    /// records with the same name, a running one wins, then the newest.
    pub fn get_by_name_or_id(&self, ident: &str) -> Result<AgentRecord> {
        self.with_doc(|doc| {
            if let Some(rec) = doc.agents.get(ident) {
                return Ok((rec.clone(), false));
            }
            let mut candidates: Vec<&AgentRecord> =
                doc.agents.values().filter(|r| r.name == ident).collect();
            candidates.sort_by_key(|r| (r.is_running(), r.started_at));
            match candidates.pop() {
                Some(rec) => Ok((rec.clone(), false)),
                None => Err(Error::RecordNotFound(ident.to_string())),
            }
        })
    }

    /// The most recently started record in scope.
    pub fn get_last(&self) -> Result<AgentRecord> {
        self.with_doc(|doc| {
            let rec = doc
                .agents
                .values()
                .filter(|r| self.scope.matches(r))
                .max_by_key(|r| r.started_at)
                .cloned()
                .ok_or_else(|| Error::RecordNotFound("last".to_string()))?;
            Ok((rec, false))
        })
    }

    /// Records in scope, ascending by start time.
    pub fn list(&self, only_running: bool) -> Result<Vec<AgentRecord>> {
        self.with_doc(|doc| {
            let mut records: Vec<AgentRecord> = doc
                .agents
                .values()
                .filter(|r| self.scope.matches(r))
                .filter(|r| !only_running || r.is_running())
                .cloned()
                .collect();
            records.sort_by_key(|r| r.started_at);
            Ok((records, false))
        })
    }

    pub fn get_children(&self, id: &str) -> Result<Vec<AgentRecord>> {
        self.with_doc(|doc| {
            let mut children: Vec<AgentRecord> = doc
                .agents
                .values()
                .filter(|r| r.parent_id.as_deref() == Some(id))
                .cloned()
                .collect();
            children.sort_by_key(|r| r.started_at);
            Ok((children, false))
        })
    }

    /// All transitive children of `id`, breadth-first.
    pub fn get_descendants(&self, id: &str) -> Result<Vec<AgentRecord>> {
        self.with_doc(|doc| {
            let mut out = Vec::new();
            let mut frontier = vec![id.to_string()];
            while let Some(parent) = frontier.pop() {
                let mut level: Vec<AgentRecord> = doc
                    .agents
                    .values()
                    .filter(|r| r.parent_id.as_deref() == Some(parent.as_str()))
                    .cloned()
                    .collect();
                level.sort_by_key(|r| r.started_at);
                for child in level {
                    frontier.push(child.id.clone());
                    out.push(child);
                }
            }
            Ok((out, false))
        })
    }

    /// Whole-record replace. Callers must hold the current version; runners
    /// use [`StateStore::merge_update`] instead.
    pub fn update(&self, record: &AgentRecord) -> Result<()> {
        self.with_doc(|doc| {
            if !doc.agents.contains_key(&record.id) {
                return Err(Error::RecordNotFound(record.id.clone()));
            }
            doc.agents.insert(record.id.clone(), record.clone());
            Ok(((), true))
        })
    }

    /// Runner-safe write-back: the control fields another process may have
    /// set since the runner's last read (`iterations`, `model`,
    /// `terminate_mode`, `paused`) are copied from disk into `record` before
    /// the write, so progress updates never clobber control intent.
    pub fn merge_update(&self, record: &mut AgentRecord) -> Result<()> {
        self.with_doc(|doc| {
            if let Some(disk) = doc.agents.get(&record.id) {
                record.iterations = disk.iterations;
                record.model = disk.model.clone();
                record.terminate_mode = disk.terminate_mode;
                record.paused = disk.paused;
                record.paused_at = disk.paused_at;
            }
            doc.agents.insert(record.id.clone(), record.clone());
            Ok(((), true))
        })
    }

    pub fn set_iterations(&self, id: &str, iterations: u32) -> Result<()> {
        self.mutate(id, |rec| rec.iterations = iterations)
    }

    pub fn set_model(&self, id: &str, model: &str) -> Result<()> {
        let model = model.to_string();
        self.mutate(id, move |rec| rec.model = model)
    }

    pub fn set_terminate_mode(&self, id: &str, mode: Option<TerminateMode>) -> Result<()> {
        self.mutate(id, move |rec| rec.terminate_mode = mode)
    }

    /// Pausing stamps `paused_at`; unpausing clears it. Idempotent: pausing
    /// an already-paused agent keeps the original timestamp.
    pub fn set_paused(&self, id: &str, paused: bool) -> Result<()> {
        self.mutate(id, move |rec| {
            if paused && !rec.paused {
                rec.paused_at = Some(Utc::now());
            } else if !paused {
                rec.paused_at = None;
            }
            rec.paused = paused;
        })
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.with_doc(|doc| {
            doc.agents
                .remove(id)
                .ok_or_else(|| Error::RecordNotFound(id.to_string()))?;
            Ok(((), true))
        })
    }

    /// Delete every terminated record in scope; returns how many went.
    pub fn prune_terminated(&self) -> Result<usize> {
        self.with_doc(|doc| {
            let before = doc.agents.len();
            let scope = self.scope.clone();
            doc.agents
                .retain(|_, r| r.is_running() || !scope.matches(r));
            let removed = before - doc.agents.len();
            Ok((removed, removed > 0))
        })
    }

    fn mutate(&self, id: &str, f: impl FnOnce(&mut AgentRecord)) -> Result<()> {
        self.with_doc(|doc| {
            let rec = doc
                .agents
                .get_mut(id)
                .ok_or_else(|| Error::RecordNotFound(id.to_string()))?;
            f(rec);
            Ok(((), true))
        })
    }

    /// Open-time sweep: any record still marked running whose process is gone
    /// (or that never got a pid within the grace period) is marked crashed.
    fn cleanup(&self) -> Result<()> {
        self.with_doc(|doc| {
            let now = Utc::now();
            let mut dirty = false;
            for rec in doc.agents.values_mut() {
                if !rec.is_running() {
                    continue;
                }
                let orphaned = if rec.pid == 0 {
                    now - rec.started_at > Duration::seconds(STARTUP_GRACE_SECS)
                } else {
                    !proc::pid_alive(rec.pid)
                };
                if orphaned {
                    warn!(id = %rec.id, pid = rec.pid, "marking orphaned agent as crashed");
                    rec.status = AgentStatus::Terminated;
                    rec.exit_reason = Some(ExitReason::Crashed);
                    rec.terminated_at = Some(now);
                    rec.paused = false;
                    rec.paused_at = None;
                    dirty = true;
                }
            }
            Ok(((), dirty))
        })
    }
}

/// Lowest free name: `base`, then `base-2`, `base-3`, ... Only running
/// records reserve names.
fn free_name(doc: &StateDoc, base: &str) -> String {
    let taken = |name: &str| {
        doc.agents
            .values()
            .any(|r| r.is_running() && r.name == name)
    };
    if !taken(base) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}-{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
