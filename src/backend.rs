//! The backend command contract: a configurable argv template with `{model}`
//! and `{prompt}` placeholders, spawned as an opaque child process.

use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// How to invoke the agent CLI. `raw_output = true` streams stdout through
/// untouched; `false` routes it through the JSONL parser.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendConfig {
    pub executable: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub raw_output: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            executable: "claude".to_string(),
            args: vec![
                "-p".into(),
                "{prompt}".into(),
                "--model".into(),
                "{model}".into(),
                "--output-format".into(),
                "stream-json".into(),
                "--verbose".into(),
            ],
            raw_output: false,
        }
    }
}

impl BackendConfig {
    /// Every argument gets both placeholders substituted literally.
    pub fn expanded_args(&self, model: &str, prompt: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{model}", model).replace("{prompt}", prompt))
            .collect()
    }

    /// Build the child command: piped stdio, the agent's working directory,
    /// the configured environment, and (on Unix) its own process group so a
    /// group kill reaches the whole tree the backend forks.
    pub fn command(
        &self,
        model: &str,
        prompt: &str,
        working_dir: &Path,
        env: &[(String, String)],
    ) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.args(self.expanded_args(model, prompt))
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}
