//! Interactive debug sessions: stage the action on disk, copy it into the
//! container, launch it under the inspector, and watch the process output
//! for the debugger's phase transitions.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{Map, Value};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::action::{ActionDescriptor, DebugResult, LogLine, RuntimeKind};
use crate::config::CONTAINER_DEBUG_PORT;
use crate::engine::LocalEngine;
use crate::error::{Error, Result};
use crate::runtime::ExecLine;

/// Entry file assumed when an archive's manifest does not declare one.
const DEFAULT_ARCHIVE_ENTRY: &str = "index.js";

/// How often and how long the inspector endpoint is polled for a session.
const INSPECTOR_POLL_INTERVAL: Duration = Duration::from_millis(250);
const INSPECTOR_POLL_ATTEMPTS: u32 = 40;

/// Classification of one line from the debuggee's error stream.
///
/// The matching depends on the exact wording of the node debugger's
/// messages, so all of it lives in [`classify_debugger_line`] and nowhere
/// else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerPhase {
    /// The wrapped function returned and the debugger is idling; the result
    /// file is ready to be copied out.
    Done,
    /// Debugger chatter that is not part of the program's own output.
    Informational,
    /// A genuine program log line.
    Program,
}

pub fn classify_debugger_line(line: &str) -> DebuggerPhase {
    if line.contains("Waiting for the debugger to disconnect") {
        DebuggerPhase::Done
    } else if line.contains("Debugger listening on")
        || line.contains("Debugger attached")
        || line.contains("For help, see:")
    {
        DebuggerPhase::Informational
    } else {
        DebuggerPhase::Program
    }
}

/// Staged debug files: a temp directory (removed on drop) and the name of
/// the entry file inside it.
#[derive(Debug)]
pub(crate) struct StagedAction {
    pub(crate) dir: TempDir,
    pub(crate) entry: String,
}

/// Harness appended after the original code: invoke the entry function with
/// the merged input and persist its (possibly promised) return value.
pub(crate) fn debug_harness(input: &Value, result_path: &str) -> String {
    format!(
        "\n\nPromise.resolve(main({input})).then(function (result) {{\n    \
         require('fs').writeFileSync({result_path:?}, JSON.stringify(result));\n}});\n"
    )
}

fn staging_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::StagingError {
        reason: format!("{context}: {e}"),
    }
}

/// File stem for a staged plain-source action, kept readable so stack traces
/// point at something recognizable.
fn sanitize_file_stem(name: &str) -> String {
    let stem: String = name
        .trim_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if stem.is_empty() {
        "action".to_string()
    } else {
        stem
    }
}

fn extract_archive(bytes: &[u8], dest: &Path) -> Result<()> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive =
        zip::ZipArchive::new(cursor).map_err(|e| staging_error("opening the action archive", e))?;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| staging_error("reading the action archive", e))?;
        let Some(rel) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            // Entries escaping the staging directory are dropped.
            warn!(name = entry.name(), "skipping archive entry with an unsafe path");
            continue;
        };
        let target = dest.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(|e| staging_error("extracting the action archive", e))?;
        std::fs::write(&target, content)?;
    }
    Ok(())
}

#[derive(Deserialize)]
struct PackageManifest {
    main: Option<String>,
}

/// Entry file declared by the archive's `package.json`; defaults to
/// `index.js` when the manifest or its `main` field is absent.
fn manifest_entry(dir: &Path) -> Result<String> {
    let manifest = dir.join("package.json");
    if !manifest.exists() {
        return Ok(DEFAULT_ARCHIVE_ENTRY.to_string());
    }
    let raw = std::fs::read_to_string(&manifest)?;
    let parsed: PackageManifest = serde_json::from_str(&raw)
        .map_err(|e| staging_error("parsing the archive manifest", e))?;
    Ok(parsed
        .main
        .unwrap_or_else(|| DEFAULT_ARCHIVE_ENTRY.to_string()))
}

/// Stage the action into a fresh temp directory and append the harness to
/// its entry file.
pub(crate) fn stage_action(
    action: &ActionDescriptor,
    input: &Value,
    result_path: &str,
) -> Result<StagedAction> {
    let dir = tempfile::tempdir().map_err(|e| staging_error("creating the staging dir", e))?;
    let harness = debug_harness(input, result_path);

    let entry = if action.binary {
        let bytes = BASE64
            .decode(action.code.trim())
            .map_err(|e| staging_error("decoding the action archive", e))?;
        extract_archive(&bytes, dir.path())?;
        let entry = manifest_entry(dir.path())?;
        let entry_path = dir.path().join(&entry);
        let code = std::fs::read_to_string(&entry_path)
            .map_err(|e| staging_error("reading the archive entry file", e))?;
        std::fs::write(&entry_path, format!("{code}{harness}"))?;
        entry
    } else {
        let entry = format!(
            "{}.{}",
            sanitize_file_stem(&action.name),
            action.kind.source_extension()
        );
        std::fs::write(dir.path().join(&entry), format!("{}{}", action.code, harness))?;
        entry
    };

    Ok(StagedAction { dir, entry })
}

/// Trailing path segment of an inspector frontend URL; the stable id a
/// caller needs to build a devtools viewer URL.
fn frontend_tail(url: &str) -> Option<String> {
    let tail = url.rsplit('/').next()?;
    if tail.is_empty() {
        None
    } else {
        Some(tail.to_string())
    }
}

#[derive(Deserialize)]
struct InspectorSession {
    #[serde(rename = "devtoolsFrontendUrl")]
    devtools_frontend_url: Option<String>,
}

/// Poll the inspector's session list until one shows up. A session never
/// appearing is not an error; the debuggee can finish without a viewer.
async fn discover_frontend(http: reqwest::Client, port: u16) -> Option<String> {
    let url = format!("http://127.0.0.1:{port}/json");
    for _ in 0..INSPECTOR_POLL_ATTEMPTS {
        if let Ok(res) = http.get(&url).send().await {
            if let Ok(sessions) = res.json::<Vec<InspectorSession>>().await {
                if let Some(frontend) = sessions
                    .into_iter()
                    .find_map(|s| s.devtools_frontend_url)
                {
                    debug!(%frontend, "inspector session discovered");
                    return frontend_tail(&frontend);
                }
            }
        }
        tokio::time::sleep(INSPECTOR_POLL_INTERVAL).await;
    }
    None
}

fn retrieval_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::ResultRetrievalError {
        reason: format!("{context}: {e}"),
    }
}

impl LocalEngine {
    /// Run the action under the node inspector inside the managed container
    /// and resolve once the wrapped function has returned.
    ///
    /// On failure the container is left running so it can be inspected,
    /// unlike the execution path which tears it down.
    pub async fn debug(
        &mut self,
        action: &ActionDescriptor,
        replayed: &Map<String, Value>,
        overrides: &Map<String, Value>,
    ) -> Result<DebugResult> {
        if !action.kind.is_nodejs() {
            return Err(Error::UnsupportedDebugTarget {
                kind: action.kind.to_string(),
            });
        }
        // The inspector wiring only exists in the debug runtime image.
        let kind = RuntimeKind::new(self.cfg.debug_kind.clone());
        self.ensure(&kind).await?;

        let input = Value::Object(action.merged_input(replayed, overrides));
        let staged = stage_action(action, &input, &self.cfg.result_path)?;

        info!(entry = %staged.entry, "copying the staged action into the container");
        self.runtime
            .copy_in(
                &self.cfg.container_name,
                staged.dir.path(),
                &self.cfg.action_dir,
            )
            .await?;

        info!("starting the debugger");
        let launch = vec![
            "node".to_string(),
            format!("--inspect-brk=0.0.0.0:{CONTAINER_DEBUG_PORT}"),
            staged.entry.clone(),
        ];
        let mut stream = self
            .runtime
            .exec_streamed(&self.cfg.container_name, &launch)
            .await?;

        let inspector = tokio::spawn(discover_frontend(self.http.clone(), self.cfg.debug_port));

        let mut logs: Vec<LogLine> = Vec::new();
        let mut done = false;
        while let Some(line) = stream.lines.recv().await {
            match line {
                ExecLine::Stdout(l) => logs.push(LogLine::stdout(l)),
                ExecLine::Stderr(l) => match classify_debugger_line(&l) {
                    DebuggerPhase::Done => {
                        done = true;
                        break;
                    }
                    DebuggerPhase::Informational => debug!(line = %l, "debugger"),
                    DebuggerPhase::Program => logs.push(LogLine::stderr(l)),
                },
            }
        }

        let frontend_id = if inspector.is_finished() {
            inspector.await.ok().flatten()
        } else {
            inspector.abort();
            None
        };

        if !done {
            // The staged directory is removed when `staged` drops here.
            return Err(Error::ResultRetrievalError {
                reason: "the debuggee exited before signaling completion".to_string(),
            });
        }

        let out_path = staged.dir.path().join("result.json");
        self.runtime
            .copy_out(&self.cfg.container_name, &self.cfg.result_path, &out_path)
            .await
            .map_err(|e| retrieval_error("copying the result file out", e))?;
        let raw = std::fs::read_to_string(&out_path)
            .map_err(|e| retrieval_error("reading the result file", e))?;
        let result: Value = serde_json::from_str(&raw)
            .map_err(|e| retrieval_error("parsing the result file", e))?;

        Ok(DebugResult {
            result,
            logs,
            frontend_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::EnsureOutcome;
    use crate::runtime::mock::MockRuntime;
    use serde_json::json;
    use std::io::Write;
    use std::sync::Arc;

    #[test]
    fn classification_covers_the_known_sentinels() {
        assert_eq!(
            classify_debugger_line("Waiting for the debugger to disconnect..."),
            DebuggerPhase::Done
        );
        assert_eq!(
            classify_debugger_line("Debugger listening on ws://0.0.0.0:5858/3f0c..."),
            DebuggerPhase::Informational
        );
        assert_eq!(
            classify_debugger_line("For help, see: https://nodejs.org/en/docs/inspector"),
            DebuggerPhase::Informational
        );
        assert_eq!(
            classify_debugger_line("Debugger attached."),
            DebuggerPhase::Informational
        );
        assert_eq!(
            classify_debugger_line("TypeError: x is not a function"),
            DebuggerPhase::Program
        );
    }

    #[test]
    fn plain_source_staging_appends_the_harness_verbatim() {
        let code = "function main(p) { return { y: p.x * 2 }; }";
        let action = ActionDescriptor {
            name: "double".into(),
            code: code.into(),
            kind: RuntimeKind::new("nodejs:8"),
            parameters: Map::new(),
            binary: false,
        };
        let input = json!({"x": 2});
        let staged = stage_action(&action, &input, "/tmp/localfn-result.json").unwrap();

        assert_eq!(staged.entry, "double.js");
        let content = std::fs::read_to_string(staged.dir.path().join("double.js")).unwrap();
        let expected = format!("{}{}", code, debug_harness(&input, "/tmp/localfn-result.json"));
        assert_eq!(content, expected);
        assert!(content.starts_with(code));
        assert!(content.contains(r#"main({"x":2})"#));
    }

    #[test]
    fn staged_file_name_tolerates_qualified_action_names() {
        let action = ActionDescriptor {
            name: "/guest/utils/echo".into(),
            code: "function main() {}".into(),
            kind: RuntimeKind::new("nodejs:8"),
            parameters: Map::new(),
            binary: false,
        };
        let staged = stage_action(&action, &json!({}), "/tmp/r.json").unwrap();
        assert_eq!(staged.entry, "guest-utils-echo.js");
    }

    fn zip_archive(files: &[(&str, &str)]) -> String {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::FileOptions::default();
            for (name, content) in files {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        BASE64.encode(cursor.into_inner())
    }

    #[test]
    fn archive_staging_wraps_only_the_manifest_entry() {
        let code = zip_archive(&[
            ("package.json", r#"{"main": "index.js"}"#),
            ("index.js", "function main(p) { return p; }"),
            ("helper.js", "module.exports = 1;"),
        ]);
        let action = ActionDescriptor {
            name: "zipped".into(),
            code,
            kind: RuntimeKind::new("nodejs:8"),
            parameters: Map::new(),
            binary: true,
        };
        let staged = stage_action(&action, &json!({}), "/tmp/r.json").unwrap();

        assert_eq!(staged.entry, "index.js");
        let entry = std::fs::read_to_string(staged.dir.path().join("index.js")).unwrap();
        assert!(entry.contains("writeFileSync"));
        let helper = std::fs::read_to_string(staged.dir.path().join("helper.js")).unwrap();
        assert_eq!(helper, "module.exports = 1;", "non-entry files stay untouched");
    }

    #[test]
    fn archive_without_a_manifest_defaults_to_index_js() {
        let code = zip_archive(&[("index.js", "function main() { return {}; }")]);
        let action = ActionDescriptor {
            name: "bare".into(),
            code,
            kind: RuntimeKind::new("nodejs:8"),
            parameters: Map::new(),
            binary: true,
        };
        let staged = stage_action(&action, &json!({}), "/tmp/r.json").unwrap();
        assert_eq!(staged.entry, "index.js");
    }

    #[test]
    fn corrupt_archive_is_a_staging_error() {
        let action = ActionDescriptor {
            name: "broken".into(),
            code: BASE64.encode(b"this is not a zip"),
            kind: RuntimeKind::new("nodejs:8"),
            parameters: Map::new(),
            binary: true,
        };
        match stage_action(&action, &json!({}), "/tmp/r.json") {
            Err(Error::StagingError { .. }) => {}
            other => panic!("expected StagingError, got {other:?}"),
        }
    }

    #[test]
    fn frontend_tail_takes_the_last_path_segment() {
        let url = "/devtools/inspector.html?experiments=true&v8only=true\
                   &ws=127.0.0.1:5858/26c6a587-f5e8-4b76-b428-6e75148a6bcb";
        assert_eq!(
            frontend_tail(url),
            Some("26c6a587-f5e8-4b76-b428-6e75148a6bcb".to_string())
        );
        assert_eq!(frontend_tail("trailing/"), None);
    }

    // ---- full pipeline against the mock runtime ----

    fn debug_engine() -> (LocalEngine, Arc<MockRuntime>) {
        let mock = MockRuntime::default();
        mock.images
            .lock()
            .unwrap()
            .push("openwhisk/action-nodejs-v8:latest".to_string());
        let mock = Arc::new(mock);
        let mut engine = LocalEngine::new(
            EngineConfig::default(),
            Box::new(Arc::clone(&mock)),
        )
        .unwrap();
        engine.inject_image_directory(
            serde_json::from_str(
                r#"{"runtimes": {"nodejs": [
                    {"kind": "nodejs:8", "image": "openwhisk/action-nodejs-v8:latest"}
                ]}}"#,
            )
            .unwrap(),
        );
        (engine, mock)
    }

    fn nodejs_action() -> ActionDescriptor {
        ActionDescriptor {
            name: "double".into(),
            code: "function main(p) { return { y: p.x * 2 }; }".into(),
            kind: RuntimeKind::new("nodejs:8"),
            parameters: Map::new(),
            binary: false,
        }
    }

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn non_nodejs_kinds_are_rejected_up_front() {
        let (mut engine, mock) = debug_engine();
        let action = ActionDescriptor {
            kind: RuntimeKind::new("python:3"),
            ..nodejs_action()
        };
        let err = engine
            .debug(&action, &Map::new(), &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedDebugTarget { .. }));
        assert!(mock.calls().is_empty(), "no container work for a rejected kind");
    }

    #[tokio::test]
    async fn debug_session_resolves_result_and_program_logs() {
        let (mut engine, mock) = debug_engine();
        mock.exec_lines.lock().unwrap().extend([
            ExecLine::Stderr("Debugger listening on ws://0.0.0.0:5858/26c6a587".into()),
            ExecLine::Stderr("For help, see: https://nodejs.org/en/docs/inspector".into()),
            ExecLine::Stdout("computing".into()),
            ExecLine::Stderr("a real program warning".into()),
            ExecLine::Stderr("Waiting for the debugger to disconnect...".into()),
        ]);
        mock.files.lock().unwrap().insert(
            "/tmp/localfn-result.json".to_string(),
            r#"{"y": 4}"#.to_string(),
        );

        let out = engine
            .debug(&nodejs_action(), &obj(json!({"x": 2})), &Map::new())
            .await
            .unwrap();

        assert_eq!(out.result, json!({"y": 4}));
        let messages: Vec<&str> = out.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["computing", "a real program warning"]);

        let calls = mock.calls();
        assert!(calls.iter().any(|c| c == "copy-in localfn /nodejsAction"));
        assert!(calls
            .iter()
            .any(|c| c.starts_with("exec localfn node --inspect-brk=0.0.0.0:5858")));
        assert!(
            engine.current_kind().is_some(),
            "the container stays up after a debug session"
        );
    }

    #[tokio::test]
    async fn debuggee_exiting_early_rejects_the_session() {
        let (mut engine, mock) = debug_engine();
        mock.exec_lines.lock().unwrap().extend([
            ExecLine::Stderr("Debugger listening on ws://0.0.0.0:5858/aa".into()),
            ExecLine::Stderr("SyntaxError: unexpected token".into()),
            // Stream ends without the done sentinel.
        ]);

        let err = engine
            .debug(&nodejs_action(), &Map::new(), &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResultRetrievalError { .. }));
        assert!(
            engine.current_kind().is_some(),
            "a failed debug session leaves the container running"
        );
    }

    #[tokio::test]
    async fn missing_result_file_is_a_retrieval_error() {
        let (mut engine, mock) = debug_engine();
        mock.exec_lines.lock().unwrap().push(ExecLine::Stderr(
            "Waiting for the debugger to disconnect...".into(),
        ));
        // No result file registered with the mock.

        let err = engine
            .debug(&nodejs_action(), &Map::new(), &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResultRetrievalError { .. }));
    }

    #[tokio::test]
    async fn debug_pins_nodejs_kinds_to_the_debug_kind() {
        let (mut engine, mock) = debug_engine();
        mock.exec_lines.lock().unwrap().push(ExecLine::Stderr(
            "Waiting for the debugger to disconnect...".into(),
        ));
        mock.files
            .lock()
            .unwrap()
            .insert("/tmp/localfn-result.json".to_string(), "{}".to_string());

        let action = ActionDescriptor {
            kind: RuntimeKind::new("nodejs:6"),
            ..nodejs_action()
        };
        engine.debug(&action, &Map::new(), &Map::new()).await.unwrap();
        assert_eq!(engine.current_kind().unwrap().as_str(), "nodejs:8");
    }

    #[tokio::test]
    async fn ensure_outcome_is_reused_for_back_to_back_debug_sessions() {
        let (mut engine, mock) = debug_engine();
        mock.files
            .lock()
            .unwrap()
            .insert("/tmp/localfn-result.json".to_string(), "{}".to_string());

        for _ in 0..2 {
            mock.exec_lines.lock().unwrap().push(ExecLine::Stderr(
                "Waiting for the debugger to disconnect...".into(),
            ));
            engine
                .debug(&nodejs_action(), &Map::new(), &Map::new())
                .await
                .unwrap();
        }
        let creates = mock
            .calls()
            .iter()
            .filter(|c| c.starts_with("create "))
            .count();
        assert_eq!(creates, 1);

        // The second session still reused the same container kind.
        assert_eq!(
            engine.ensure(&RuntimeKind::new("nodejs:8")).await.unwrap(),
            EnsureOutcome::Reused
        );
    }
}
