//! The compose document: declarative tasks and pipelines, loaded from TOML.
//!
//! Tasks name exactly one prompt source. Dependencies accept either the
//! shorthand `"taskname"` (meaning success) or the full
//! `{ task = "...", condition = "..." }` form; loading expands the shorthand.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Condition on a dependency edge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepCondition {
    #[default]
    Success,
    Failure,
    Any,
    Always,
}

impl std::fmt::Display for DepCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Any => write!(f, "any"),
            Self::Always => write!(f, "always"),
        }
    }
}

/// A dependency edge. Deserializes from either a bare task name or the full
/// table form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DependencySpec")]
pub struct Dependency {
    pub task: String,
    pub condition: DepCondition,
}

impl Dependency {
    pub fn on(task: impl Into<String>, condition: DepCondition) -> Self {
        Self {
            task: task.into(),
            condition,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DependencySpec {
    Name(String),
    Full {
        task: String,
        #[serde(default)]
        condition: DepCondition,
    },
}

impl From<DependencySpec> for Dependency {
    fn from(spec: DependencySpec) -> Self {
        match spec {
            DependencySpec::Name(task) => Dependency {
                task,
                condition: DepCondition::Success,
            },
            DependencySpec::Full { task, condition } => Dependency { task, condition },
        }
    }
}

/// Where a task's prompt comes from. Resolution of named prompts is the
/// caller's concern; the engine passes the identifier through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptSource {
    Named(String),
    File(String),
    Inline(String),
}

/// One task in the compose document. Immutable after load.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, rename = "prompt-file", skip_serializing_if = "Option::is_none")]
    pub prompt_file: Option<String>,
    #[serde(default, rename = "prompt-string", skip_serializing_if = "Option::is_none")]
    pub prompt_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Agent loop iterations for this task; 0 means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    /// Runner instances spawned for this task within one pipeline iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u32>,
    /// Global across-pipeline cap on concurrent runs of this task; 0 means
    /// unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<Dependency>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl TaskDefinition {
    /// The task's single prompt source. Errors when zero or several are set.
    pub fn prompt_source(&self) -> Result<PromptSource> {
        let mut sources = Vec::new();
        if let Some(p) = &self.prompt {
            sources.push(PromptSource::Named(p.clone()));
        }
        if let Some(p) = &self.prompt_file {
            sources.push(PromptSource::File(p.clone()));
        }
        if let Some(p) = &self.prompt_string {
            sources.push(PromptSource::Inline(p.clone()));
        }
        match sources.len() {
            1 => Ok(sources.pop().unwrap()),
            0 => Err(Error::validation(
                "task needs one of prompt, prompt-file, prompt-string",
            )),
            _ => Err(Error::validation(
                "task sets more than one of prompt, prompt-file, prompt-string",
            )),
        }
    }
}

/// A named DAG run: iteration count, in-iteration parallelism, and the task
/// subset it covers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pipeline {
    /// Times the whole DAG is executed, sequentially. Defaults to 1.
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Cap on tasks running concurrently within one iteration; 0 means
    /// unlimited.
    #[serde(default)]
    pub parallelism: u32,
    /// Concurrent independent instances of this pipeline. Defaults to 1.
    #[serde(default = "default_instances")]
    pub instances: u32,
    /// Task names to include; omitted means every task in the document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<String>>,
}

fn default_iterations() -> u32 {
    1
}

fn default_instances() -> u32 {
    1
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            iterations: 1,
            parallelism: 0,
            instances: 1,
            tasks: None,
        }
    }
}

/// Top-level compose document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ComposeFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tasks: BTreeMap<String, TaskDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pipelines: BTreeMap<String, Pipeline>,
}

impl ComposeFile {
    pub fn parse(input: &str) -> Result<Self> {
        let doc: ComposeFile =
            toml::from_str(input).map_err(|e| Error::validation(e.to_string()))?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let input = std::fs::read_to_string(path)?;
        Self::parse(&input)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::internal(e.to_string()))
    }

    /// Document-level validation: every task has exactly one prompt source,
    /// and every dependency or pipeline task list points at a task that
    /// exists.
    pub fn validate(&self) -> Result<()> {
        for (name, task) in &self.tasks {
            task.prompt_source()
                .map_err(|e| Error::validation(format!("task '{name}': {e}")))?;
            for dep in &task.depends_on {
                if !self.tasks.contains_key(&dep.task) {
                    return Err(Error::validation(format!(
                        "task '{name}' depends on unknown task '{}'",
                        dep.task
                    )));
                }
            }
        }
        for (name, pipeline) in &self.pipelines {
            if let Some(tasks) = &pipeline.tasks {
                for t in tasks {
                    if !self.tasks.contains_key(t) {
                        return Err(Error::validation(format!(
                            "pipeline '{name}' references unknown task '{t}'"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// The tasks a pipeline covers, in name order.
    pub fn pipeline_tasks(&self, pipeline: &Pipeline) -> Vec<String> {
        match &pipeline.tasks {
            Some(names) => names.clone(),
            None => self.tasks.keys().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version = 1

[tasks.plan]
prompt-string = "write a plan"
model = "opus"

[tasks.build]
prompt-string = "implement the plan"
depends_on = ["plan"]

[tasks.review]
prompt-string = "review the build"
depends_on = [{ task = "build", condition = "any" }]

[pipelines.main]
iterations = 3
parallelism = 2
tasks = ["plan", "build", "review"]
"#;

    #[test]
    fn parses_shorthand_and_full_dependencies() {
        let doc = ComposeFile::parse(SAMPLE).unwrap();
        let build = &doc.tasks["build"];
        assert_eq!(
            build.depends_on,
            vec![Dependency::on("plan", DepCondition::Success)]
        );
        let review = &doc.tasks["review"];
        assert_eq!(
            review.depends_on,
            vec![Dependency::on("build", DepCondition::Any)]
        );
    }

    #[test]
    fn pipeline_defaults() {
        let doc = ComposeFile::parse("[tasks.a]\nprompt-string = \"x\"\n[pipelines.p]\n").unwrap();
        let p = &doc.pipelines["p"];
        assert_eq!(p.iterations, 1);
        assert_eq!(p.parallelism, 0);
        assert_eq!(p.instances, 1);
        assert!(p.tasks.is_none());
        assert_eq!(doc.pipeline_tasks(p), vec!["a".to_string()]);
    }

    #[test]
    fn rejects_missing_prompt_source() {
        let err = ComposeFile::parse("[tasks.a]\nmodel = \"opus\"\n").unwrap_err();
        assert!(err.to_string().contains("prompt"));
    }

    #[test]
    fn rejects_multiple_prompt_sources() {
        let input = "[tasks.a]\nprompt = \"p\"\nprompt-string = \"s\"\n";
        let err = ComposeFile::parse(input).unwrap_err();
        assert!(err.to_string().contains("more than one"));
    }

    #[test]
    fn rejects_unknown_dependency_target() {
        let input = "[tasks.a]\nprompt-string = \"x\"\ndepends_on = [\"ghost\"]\n";
        let err = ComposeFile::parse(input).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn rejects_negative_iterations() {
        let input = "[tasks.a]\nprompt-string = \"x\"\n[pipelines.p]\niterations = -1\n";
        assert!(ComposeFile::parse(input).is_err());
    }

    #[test]
    fn roundtrip_modulo_shorthand_expansion() {
        let doc = ComposeFile::parse(SAMPLE).unwrap();
        let saved = doc.to_toml().unwrap();
        let reloaded = ComposeFile::parse(&saved).unwrap();
        assert_eq!(reloaded.tasks.len(), doc.tasks.len());
        assert_eq!(
            reloaded.tasks["build"].depends_on,
            doc.tasks["build"].depends_on
        );
        assert_eq!(reloaded.pipelines["main"].iterations, 3);
        assert_eq!(
            reloaded.pipelines["main"].tasks.as_deref(),
            doc.pipelines["main"].tasks.as_deref()
        );
    }
}
