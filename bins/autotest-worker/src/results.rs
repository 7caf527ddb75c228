/// Result Aggregator - Tester Output to Result Envelope
///
/// **Core Responsibility:**
/// Turn the raw stdout/stderr/exit status of each test group run into
/// `TestGroupResult`s and fold them into one `ResultEnvelope`.
///
/// **Critical Properties:**
/// - Knows nothing about processes, Redis or the filesystem
/// - Pure function: (group outputs) → envelope
///
/// **Parsing Rules:**
/// - One JSON object per stdout line; blank lines are ignored
/// - Objects carrying `annotations`, `tags`, `overall_comment` or
///   `feedback` and no `status` go to the side channel
/// - The first malformed line stops parsing for that group; the rest of the
///   output is kept verbatim in `malformed`
///
/// **Failure Rules:**
/// - Parsed outcomes are always kept, whatever the exit status
/// - A group that crashed, timed out, failed to start or printed garbage
///   without producing a single outcome yields exactly one synthetic
///   `error` outcome carrying stderr (or the timeout/launch error)

use autotest_common::types::{ResultEnvelope, TestGroupResult, TestOutcome, TesterType};
use serde_json::{Map, Value};
use tracing::debug;

const SIDE_CHANNEL_KEYS: [&str; 4] = ["annotations", "tags", "overall_comment", "feedback"];

/// Raw output of one test group run
/// Produced by the engine, consumed by the aggregator
#[derive(Debug, Clone, Default)]
pub struct GroupExecutionOutput {
    pub tester_type: Option<TesterType>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Wall-clock budget the group ran under, in seconds
    pub timeout_secs: u64,
    pub elapsed_ms: u64,
    /// Set when the tester could not be started at all
    pub launch_error: Option<String>,
    pub extra_info: Map<String, Value>,
}

/// Non-outcome tester output collected across all groups of a job
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SideChannel {
    pub annotations: Vec<Value>,
    pub tags: Vec<Value>,
    pub overall_comments: Vec<String>,
    pub feedback: Vec<Value>,
}

impl SideChannel {
    fn absorb(&mut self, obj: &Map<String, Value>) {
        fn extend(target: &mut Vec<Value>, value: Option<&Value>) {
            match value {
                Some(Value::Array(items)) => target.extend(items.iter().cloned()),
                Some(Value::Null) | None => {}
                Some(other) => target.push(other.clone()),
            }
        }

        extend(&mut self.annotations, obj.get("annotations"));
        extend(&mut self.tags, obj.get("tags"));
        extend(&mut self.feedback, obj.get("feedback"));
        match obj.get("overall_comment") {
            Some(Value::String(s)) => self.overall_comments.push(s.clone()),
            Some(Value::Null) | None => {}
            Some(other) => self.overall_comments.push(other.to_string()),
        }
    }
}

enum ParsedLine {
    Outcome(TestOutcome),
    Side(Map<String, Value>),
}

fn parse_line(line: &str) -> Option<ParsedLine> {
    let value: Value = serde_json::from_str(line).ok()?;
    let obj = value.as_object()?;
    if !obj.contains_key("status") && SIDE_CHANNEL_KEYS.iter().any(|k| obj.contains_key(*k)) {
        return Some(ParsedLine::Side(obj.clone()));
    }
    serde_json::from_value(value).ok().map(ParsedLine::Outcome)
}

fn failure_message(output: &GroupExecutionOutput, malformed: Option<&str>) -> Option<String> {
    let stderr = output.stderr.trim();
    let with_stderr = |head: String| {
        if stderr.is_empty() {
            head
        } else {
            format!("{}\n{}", head, stderr)
        }
    };

    if let Some(err) = &output.launch_error {
        return Some(with_stderr(format!("Tester could not be started: {}", err)));
    }
    if output.timed_out {
        return Some(with_stderr(format!("Tester timed out after {} seconds", output.timeout_secs)));
    }
    match output.exit_code {
        Some(0) => {}
        Some(code) if !stderr.is_empty() => return Some(format!("{} (exit code {})", stderr, code)),
        Some(code) => return Some(format!("Tester exited with code {}", code)),
        None => return Some(with_stderr("Tester was terminated by a signal".to_string())),
    }
    malformed.map(|m| with_stderr(format!("Malformed tester output: {}", m.lines().next().unwrap_or(""))))
}

/// Evaluate one group run; side-channel lines are added to `side`
pub fn evaluate_group(output: &GroupExecutionOutput, side: &mut SideChannel) -> TestGroupResult {
    let mut tests = Vec::new();
    let mut malformed = None;

    let lines: Vec<&str> = output.stdout.lines().collect();
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line) {
            Some(ParsedLine::Outcome(outcome)) => tests.push(outcome),
            Some(ParsedLine::Side(obj)) => side.absorb(&obj),
            None => {
                debug!(line = idx + 1, "Malformed tester output, parsing stopped");
                malformed = Some(lines[idx..].join("\n"));
                break;
            }
        }
    }

    if tests.is_empty() {
        if let Some(message) = failure_message(output, malformed.as_deref()) {
            tests.push(TestOutcome::error("tester", message));
        }
    }

    TestGroupResult {
        tester_type: output.tester_type,
        time_ms: output.elapsed_ms,
        timeout: output.timed_out.then_some(output.timeout_secs),
        tests,
        stderr: Some(output.stderr.clone()).filter(|s| !s.trim().is_empty()),
        malformed,
        extra_info: output.extra_info.clone(),
    }
}

/// Result for a group that was never started because the job's time budget
/// was used up by earlier groups
pub fn budget_exhausted(tester_type: TesterType, extra_info: Map<String, Value>) -> TestGroupResult {
    TestGroupResult {
        tester_type: Some(tester_type),
        time_ms: 0,
        timeout: Some(0),
        tests: vec![TestOutcome::error(
            "tester",
            "Not run: the job's time limit was reached before this test group started",
        )],
        stderr: None,
        malformed: None,
        extra_info,
    }
}

/// Fold every group result and the side channel into one envelope
pub fn aggregate(test_groups: Vec<TestGroupResult>, side: SideChannel) -> ResultEnvelope {
    let mut envelope = ResultEnvelope::finished(test_groups);
    envelope.annotations = side.annotations;
    envelope.tags = side.tags;
    envelope.overall_comments = side.overall_comments;
    envelope.feedback = side.feedback;
    debug!(
        groups = envelope.test_groups.len(),
        points_earned = envelope.points_earned,
        points_total = envelope.points_total,
        "Results aggregated"
    );
    envelope
}
