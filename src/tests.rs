use std::sync::{Arc, Mutex};

use crate::parser::LogParser;
use swarm_core::UsageStats;

/// A sink the test can read back after the parser is done with it.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn parser() -> (LogParser, SharedBuf) {
    let buf = SharedBuf::default();
    (LogParser::new(Box::new(buf.clone())), buf)
}

#[test]
fn hostile_corpus_never_panics() {
    let (mut p, buf) = parser();
    let long_raw = "a".repeat(100 * 1024);
    let long_json = format!(r#"{{"type":"assistant","text":"{}"}}"#, "x".repeat(100 * 1024));
    let corpus: Vec<String> = vec![
        String::new(),
        "   ".into(),
        "{invalid".into(),
        "null".into(),
        "[1,2,3]".into(),
        r#"{"type":null,"subtype":null,"message":null,"tool_call":null,"result":null}"#.into(),
        r#"{"type":"assistant","message":{"role":null,"content":[{"type":"text","text":null}]}}"#
            .into(),
        r#"{"type":"assistant","message":{"content":"深くネストされた日本語 🦀"}}"#.into(),
        long_raw,
        long_json,
        r#"{"type":"system","subtype":"init","model":"sonnet","cwd":"/tmp"}"#.into(),
        r#"{"type":"thinking","text":"hmm"}"#.into(),
        r#"{"type":"user","message":{"content":"hi"}}"#.into(),
        r#"{"type":"tool_call","tool_call":{"shell":{"command":"ls"}}}"#.into(),
        r#"{"type":"result","subtype":"success","duration_ms":5,"result":"ok"}"#.into(),
        r#"{"type":"zorp_event_9000"}"#.into(),
        r#"{"subtype":"orphan"}"#.into(),
        r#"{"tool_call":"not-a-map"}"#.into(),
        r#"{"usage":{"input_tokens":"not-a-number"}}"#.into(),
        r#"{"usage":{"input_tokens":12,"output_tokens":3}}"#.into(),
    ];
    for line in &corpus {
        p.process(line);
    }
    p.finish();
    assert!(!buf.contents().is_empty());
}

#[test]
fn empty_lines_are_ignored() {
    let (mut p, buf) = parser();
    p.process("");
    p.process("   \t  ");
    p.finish();
    assert_eq!(buf.contents(), "");
}

#[test]
fn non_json_lines_pass_through_verbatim() {
    let (mut p, buf) = parser();
    p.process("plain progress text");
    p.finish();
    assert_eq!(buf.contents(), "plain progress text\n");
}

#[test]
fn malformed_json_passes_through_verbatim() {
    let (mut p, buf) = parser();
    p.process("{definitely not json");
    p.finish();
    assert!(buf.contents().contains("{definitely not json"));
}

#[test]
fn consecutive_assistant_events_merge_into_one_run() {
    let (mut p, buf) = parser();
    p.process(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"first"}]}}"#);
    p.process(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"second"}]}}"#);
    p.finish();
    let out = buf.contents();
    assert_eq!(out.matches("assistant:").count(), 1);
    assert!(out.contains("first"));
    assert!(out.contains("second"));
}

#[test]
fn role_change_flushes_the_run() {
    let (mut p, buf) = parser();
    p.process(r#"{"type":"assistant","text":"working"}"#);
    p.process(r#"{"type":"user","text":"keep going"}"#);
    p.finish();
    let out = buf.contents();
    assert_eq!(out.matches("assistant:").count(), 1);
    assert_eq!(out.matches("user:").count(), 1);
}

#[test]
fn tool_call_renders_summary_and_updates_task() {
    let (mut p, buf) = parser();
    p.process(r#"{"type":"tool_call","tool_call":{"shell":{"command":"cargo test --all"}}}"#);
    p.finish();
    assert!(buf.contents().contains("[tool] shell: cargo test --all"));
    assert_eq!(p.stats().current_task, "shell: cargo test --all");
}

#[test]
fn system_init_one_line_summary() {
    let (mut p, buf) = parser();
    p.process(
        r#"{"type":"system","subtype":"init","model":"sonnet","cwd":"/repo","session_id":"s-1"}"#,
    );
    p.finish();
    let out = buf.contents();
    assert!(out.contains("system init"));
    assert!(out.contains("model=sonnet"));
    assert!(out.contains("cwd=/repo"));
    assert!(out.contains("session=s-1"));
}

#[test]
fn result_event_with_duration_and_empty_text() {
    let (mut p, buf) = parser();
    p.process(r#"{"type":"result","subtype":"success","duration_ms":2100,"result":"all done"}"#);
    p.process(r#"{"type":"result","subtype":"error_max_turns"}"#);
    p.finish();
    let out = buf.contents();
    assert!(out.contains("result [success] (2100ms): all done"));
    assert!(out.contains("result [error_max_turns]: (empty)"));
    assert_eq!(p.stats().current_task, "result/error_max_turns");
}

#[test]
fn multiline_result_is_single_lined() {
    let (mut p, buf) = parser();
    p.process(r#"{"type":"result","subtype":"success","result":"line one\nline two"}"#);
    p.finish();
    assert!(buf.contents().contains("result [success]: line one line two"));
}

#[test]
fn unknown_event_types_render_placeholders() {
    let (mut p, buf) = parser();
    p.process(r#"{"type":"telemetry_v2"}"#);
    p.process(r#"{"subtype":"nothing else"}"#);
    p.finish();
    let out = buf.contents();
    assert!(out.contains("telemetry_v2 event"));
    assert!(out.contains("(unknown event)"));
}

#[test]
fn usage_tokens_accumulate_across_events() {
    let (mut p, _buf) = parser();
    p.process(r#"{"type":"assistant","text":"a","usage":{"input_tokens":100,"output_tokens":20}}"#);
    p.process(r#"{"type":"assistant","text":"b","usage":{"prompt_tokens":50,"completion_tokens":5}}"#);
    p.process(r#"{"type":"result","input_tokens":7,"output_tokens":3}"#);
    assert_eq!(p.stats().input_tokens, 157);
    assert_eq!(p.stats().output_tokens, 28);
}

#[test]
fn cost_keeps_the_running_total() {
    let (mut p, _buf) = parser();
    p.process(r#"{"type":"result","total_cost_usd":0.25}"#);
    p.process(r#"{"type":"result","total_cost_usd":0.75}"#);
    p.process(r#"{"type":"result","total_cost_usd":0.40}"#);
    assert!((p.stats().total_cost_usd - 0.75).abs() < f64::EPSILON);
}

#[test]
fn usage_callback_fires_on_token_bearing_events() {
    let calls: Arc<Mutex<Vec<UsageStats>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = calls.clone();
    let buf = SharedBuf::default();
    let mut p = LogParser::new(Box::new(buf)).on_usage(Box::new(move |stats| {
        seen.lock().unwrap().push(stats.clone());
    }));

    p.process(r#"{"type":"assistant","text":"x"}"#);
    p.process(r#"{"usage":{"input_tokens":10,"output_tokens":2}}"#);
    let calls = calls.lock().unwrap();
    assert!(!calls.is_empty());
    assert_eq!(calls.last().unwrap().input_tokens, 10);
}

#[test]
fn assistant_text_truncated_into_current_task() {
    let (mut p, _buf) = parser();
    let long = "word ".repeat(40);
    p.process(&format!(r#"{{"type":"assistant","text":"{long}"}}"#));
    assert!(p.stats().current_task.chars().count() <= 51);
    assert!(p.stats().current_task.ends_with('…'));
}
