//! Streaming parser for backend JSONL output.
//!
//! The contract is total: `process` returns normally for every input line.
//! Anything that fails to decode, or faults while being handled, is emitted
//! verbatim to the sink and the stream continues. A supervisor that dies on a
//! malformed log line is worse than one that prints raw text.

use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};

use swarm_core::{LogEvent, UsageStats};

use crate::format;

#[derive(Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Assistant,
    User,
    Thinking,
}

impl RunKind {
    fn label(self) -> &'static str {
        match self {
            Self::Assistant => "assistant",
            Self::User => "user",
            Self::Thinking => "thinking",
        }
    }
}

pub type UsageCallback = Box<dyn FnMut(&UsageStats) + Send>;

/// One parser per child stream. Accumulates telemetry as a side effect of
/// pretty-printing; consecutive assistant/user/thinking events merge into a
/// single displayed run.
pub struct LogParser {
    sink: Box<dyn Write + Send>,
    stats: UsageStats,
    run: Option<(RunKind, String)>,
    on_usage: Option<UsageCallback>,
}

impl LogParser {
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink,
            stats: UsageStats::default(),
            run: None,
            on_usage: None,
        }
    }

    /// Invoked whenever any accumulated field changes.
    pub fn on_usage(mut self, callback: UsageCallback) -> Self {
        self.on_usage = Some(callback);
        self
    }

    pub fn stats(&self) -> &UsageStats {
        &self.stats
    }

    /// Feed one line. Never panics: a fault anywhere downgrades to raw
    /// emission of the line.
    pub fn process(&mut self, line: &str) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.process_inner(line)));
        if outcome.is_err() {
            self.run = None;
            self.emit(line);
        }
    }

    /// Flush any in-progress run. Call once at end of stream.
    pub fn finish(&mut self) {
        self.flush_run();
        let _ = self.sink.flush();
    }

    fn process_inner(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if !line.starts_with('{') {
            self.flush_run();
            self.emit(line);
            return;
        }
        match serde_json::from_str::<LogEvent>(line) {
            Ok(event) => self.handle(event),
            Err(_) => {
                self.flush_run();
                self.emit(line);
            }
        }
    }

    fn handle(&mut self, event: LogEvent) {
        let mut changed = self.accumulate_tokens(&event);

        match event.event_type.as_deref() {
            Some("system") | Some("init") => {
                self.flush_run();
                let mut summary = String::from("system init");
                if let Some(model) = &event.model {
                    summary.push_str(&format!(" model={model}"));
                }
                if let Some(cwd) = &event.cwd {
                    summary.push_str(&format!(" cwd={cwd}"));
                }
                if let Some(session) = &event.session_id {
                    summary.push_str(&format!(" session={session}"));
                }
                self.emit(&summary);
                changed |= self.set_task(format::trim_snippet(&summary));
            }
            Some("thinking") => {
                let text = event.text.clone().unwrap_or_default();
                self.append_run(RunKind::Thinking, &text);
            }
            Some("assistant") | Some("user") => {
                let kind = if event.event_type.as_deref() == Some("assistant") {
                    RunKind::Assistant
                } else {
                    RunKind::User
                };
                let text = extract_text(&event);
                self.append_run(kind, &text);
                if kind == RunKind::Assistant && !text.trim().is_empty() {
                    changed |= self.set_task(format::trim_snippet(&text));
                }
            }
            Some("tool_call") => {
                changed |= self.render_tool_call(&event);
            }
            Some("result") => {
                self.flush_run();
                let subtype = event.subtype.clone().unwrap_or_else(|| "result".into());
                let text = event
                    .result
                    .as_ref()
                    .map(value_text)
                    .map(|t| format::single_line(&t))
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| "(empty)".into());
                match event.duration_ms {
                    Some(ms) => self.emit(&format!("result [{subtype}] ({ms}ms): {text}")),
                    None => self.emit(&format!("result [{subtype}]: {text}")),
                }
                changed |= self.set_task(format!("result/{subtype}"));
            }
            Some(other) => {
                // An event type we don't know, or a known field riding on an
                // unnamed event; tool calls can appear either way.
                if event.tool_call.is_some() {
                    changed |= self.render_tool_call(&event);
                } else {
                    self.flush_run();
                    self.emit(&format!("{other} event"));
                }
            }
            None => {
                if event.tool_call.is_some() {
                    changed |= self.render_tool_call(&event);
                } else {
                    self.flush_run();
                    self.emit("(unknown event)");
                }
            }
        }

        if changed {
            if let Some(callback) = self.on_usage.as_mut() {
                callback(&self.stats);
            }
        }
    }

    fn accumulate_tokens(&mut self, event: &LogEvent) -> bool {
        let mut changed = false;
        if let Some(usage) = &event.usage {
            let (input, output) = (usage.input(), usage.output());
            if input > 0 {
                self.stats.input_tokens += input;
                changed = true;
            }
            if output > 0 {
                self.stats.output_tokens += output;
                changed = true;
            }
        }
        if let Some(n) = event.input_tokens {
            if n > 0 {
                self.stats.input_tokens += n;
                changed = true;
            }
        }
        if let Some(n) = event.output_tokens {
            if n > 0 {
                self.stats.output_tokens += n;
                changed = true;
            }
        }
        if let Some(cost) = event.total_cost_usd {
            // Backends report cost as a running total; keep the high-water mark.
            if cost > self.stats.total_cost_usd {
                self.stats.total_cost_usd = cost;
                changed = true;
            }
        }
        changed
    }

    fn render_tool_call(&mut self, event: &LogEvent) -> bool {
        self.flush_run();
        let summary = event
            .tool_call
            .as_ref()
            .map(|call| format::summarize_tool_call(call))
            .unwrap_or_else(|| "(empty tool call)".into());
        self.emit(&format!("[tool] {summary}"));
        self.set_task(summary)
    }

    fn set_task(&mut self, task: String) -> bool {
        if self.stats.current_task == task {
            return false;
        }
        self.stats.current_task = task;
        true
    }

    fn append_run(&mut self, kind: RunKind, text: &str) {
        match &mut self.run {
            Some((current, buffer)) if *current == kind => {
                if !text.is_empty() {
                    if !buffer.is_empty() {
                        buffer.push('\n');
                    }
                    buffer.push_str(text);
                }
            }
            _ => {
                self.flush_run();
                self.run = Some((kind, text.to_string()));
            }
        }
    }

    fn flush_run(&mut self) {
        if let Some((kind, text)) = self.run.take() {
            self.emit(&format!("{}: {}", kind.label(), text));
        }
    }

    fn emit(&mut self, line: &str) {
        // Sink failures must never stop the stream.
        let _ = writeln!(self.sink, "{line}");
    }
}

/// Pull displayable text out of an assistant/user event: the `text` field,
/// or the text items of the message content.
fn extract_text(event: &LogEvent) -> String {
    if let Some(text) = &event.text {
        return text.clone();
    }
    let Some(message) = &event.message else {
        return String::new();
    };
    match &message.content {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(items)) => {
            let mut parts = Vec::new();
            for item in items {
                if let Some(t) = item.get("text").and_then(|v| v.as_str()) {
                    parts.push(t.to_string());
                }
            }
            parts.join("\n")
        }
        _ => String::new(),
    }
}

/// Coerce a result value to display text.
fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
