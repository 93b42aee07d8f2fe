use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier for a language/runtime environment, e.g. `nodejs:8`.
///
/// Used as the equality key for container reuse and image lookup; the engine
/// never interprets the string beyond its language prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuntimeKind(String);

impl RuntimeKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_nodejs(&self) -> bool {
        self.0.starts_with("nodejs")
    }

    /// Source file extension for staged files, chosen from the language
    /// prefix. Unknown kinds fall back to `txt`.
    pub fn source_extension(&self) -> &'static str {
        let lang = self.0.split(':').next().unwrap_or("");
        match lang {
            "nodejs" => "js",
            "python" => "py",
            "swift" => "swift",
            "php" => "php",
            "java" => "jar",
            _ => "txt",
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied description of the action to run or debug.
///
/// For binary actions `code` holds a base64-encoded zip archive whose
/// manifest (`package.json`) declares the entry file.
#[derive(Debug, Clone)]
pub struct ActionDescriptor {
    pub name: String,
    pub code: String,
    pub kind: RuntimeKind,
    /// Parameters declared on the action; lowest merge precedence.
    pub parameters: Map<String, Value>,
    pub binary: bool,
}

impl ActionDescriptor {
    /// Merge the run input. Precedence, lowest to highest: declared
    /// parameters, replayed activation input, explicit caller overrides.
    pub fn merged_input(
        &self,
        replayed: &Map<String, Value>,
        overrides: &Map<String, Value>,
    ) -> Map<String, Value> {
        let mut merged = self.parameters.clone();
        for (k, v) in replayed {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in overrides {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }
}

/// Which stream a collected log line came from. `Error` marks synthetic
/// lines produced when the log subscription itself hit a stream error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    Error,
}

/// One line of container output, stamped when it was observed.
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub stream: LogStream,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl LogLine {
    pub fn new(stream: LogStream, message: impl Into<String>) -> Self {
        Self {
            stream,
            message: message.into(),
            time: Utc::now(),
        }
    }

    pub fn stdout(message: impl Into<String>) -> Self {
        Self::new(LogStream::Stdout, message)
    }

    pub fn stderr(message: impl Into<String>) -> Self {
        Self::new(LogStream::Stderr, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogStream::Error, message)
    }
}

/// Outcome of one init/run invocation.
#[derive(Debug, Serialize)]
pub struct ExecutionResult {
    /// Latency of the init call; `None` when init was skipped because the
    /// container already had this exact code loaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_time_ms: Option<u64>,
    /// Latency of the run call.
    pub duration_ms: u64,
    pub result: Value,
    pub logs: Vec<LogLine>,
}

/// Outcome of one debug session.
#[derive(Debug, Serialize)]
pub struct DebugResult {
    pub result: Value,
    pub logs: Vec<LogLine>,
    /// Trailing path segment of the first inspector session's frontend URL,
    /// usable to build a devtools viewer URL. `None` when no session was
    /// observed before the debuggee finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frontend_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn merge_precedence_overrides_win() {
        let action = ActionDescriptor {
            name: "echo".into(),
            code: "function main(p) { return p; }".into(),
            kind: RuntimeKind::new("nodejs:8"),
            parameters: obj(json!({"a": 1, "b": 1, "c": 1})),
            binary: false,
        };
        let replayed = obj(json!({"b": 2, "c": 2}));
        let overrides = obj(json!({"c": 3}));

        let merged = action.merged_input(&replayed, &overrides);
        assert_eq!(merged.get("a"), Some(&json!(1)));
        assert_eq!(merged.get("b"), Some(&json!(2)));
        assert_eq!(merged.get("c"), Some(&json!(3)));
    }

    #[test]
    fn merge_keeps_declared_parameters_when_nothing_overrides() {
        let action = ActionDescriptor {
            name: "echo".into(),
            code: String::new(),
            kind: RuntimeKind::new("nodejs:8"),
            parameters: obj(json!({"greeting": "hello"})),
            binary: false,
        };
        let merged = action.merged_input(&Map::new(), &Map::new());
        assert_eq!(merged.get("greeting"), Some(&json!("hello")));
    }

    #[test]
    fn source_extension_from_kind() {
        assert_eq!(RuntimeKind::new("nodejs:8").source_extension(), "js");
        assert_eq!(RuntimeKind::new("python:3").source_extension(), "py");
        assert_eq!(RuntimeKind::new("blackbox").source_extension(), "txt");
    }

    #[test]
    fn nodejs_detection() {
        assert!(RuntimeKind::new("nodejs:8").is_nodejs());
        assert!(RuntimeKind::new("nodejs:6").is_nodejs());
        assert!(!RuntimeKind::new("python:3").is_nodejs());
    }
}
