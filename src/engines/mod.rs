//! Engine adapters.
//!
//! Each supported AI CLI gets an adapter exposing a uniform capability
//! surface: probe, model list, spawn, follow-up spawn, and a pure
//! line-normalization function. Adapters are stateless; they hand the
//! spawned process back to the execution engine, which owns it from then
//! on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::errors::EngineError;
use crate::models::{EngineType, NormalizedEntry, PermissionMode};

pub mod claude;
pub mod codex;
pub mod echo;
pub mod gemini;
pub mod rpc;

/// Hard bound on a full availability probe. A probe that exceeds this is
/// reported as installed-but-not-executable.
const PROBE_HARD_BOUND: Duration = Duration::from_secs(30);

/// Outer timeout on the `--version` subprocess inside a probe.
pub(crate) const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long probe results stay cached.
const PROBE_CACHE_TTL: Duration = Duration::from_secs(600);

// ── Capability surface types ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Authenticated,
    Unauthenticated,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub installed: bool,
    pub executable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub auth_status: AuthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Availability {
    pub fn missing(error: impl Into<String>) -> Self {
        Self {
            installed: false,
            executable: false,
            version: None,
            auth_status: AuthStatus::Unknown,
            error: Some(error.into()),
        }
    }

    pub fn timed_out() -> Self {
        Self {
            installed: true,
            executable: false,
            version: None,
            auth_status: AuthStatus::Unknown,
            error: Some("timeout".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_default: Option<bool>,
}

/// Options for spawning an execution.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub prompt: String,
    pub working_dir: Option<PathBuf>,
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    /// Session to resume when the engine supports continuity.
    pub external_session_id: Option<String>,
}

/// Where follow-up user input goes while the process runs.
#[derive(Debug)]
pub enum ProcessInput {
    /// JSON-lines user messages over the child's stdin.
    JsonLines(tokio::process::ChildStdin),
    /// Plain text lines over stdin.
    PlainLines(tokio::process::ChildStdin),
    /// Command channel into a JSON-RPC session task.
    Rpc(tokio::sync::mpsc::Sender<rpc::RpcCommand>),
    Closed,
}

impl ProcessInput {
    /// Deliver a user message to the running process in whatever shape the
    /// engine expects.
    pub async fn send_user_message(
        &mut self,
        prompt: &str,
        model: Option<&str>,
    ) -> Result<(), EngineError> {
        match self {
            Self::JsonLines(stdin) => {
                let message = serde_json::json!({
                    "type": "user",
                    "message": {
                        "role": "user",
                        "content": [{"type": "text", "text": prompt}],
                    },
                });
                let mut line = message.to_string();
                line.push('\n');
                stdin
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|e| EngineError::Stream(format!("stdin write failed: {}", e)))?;
                stdin
                    .flush()
                    .await
                    .map_err(|e| EngineError::Stream(format!("stdin flush failed: {}", e)))?;
                Ok(())
            }
            Self::PlainLines(stdin) => {
                let mut line = prompt.replace('\n', " ");
                line.push('\n');
                stdin
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|e| EngineError::Stream(format!("stdin write failed: {}", e)))?;
                stdin
                    .flush()
                    .await
                    .map_err(|e| EngineError::Stream(format!("stdin flush failed: {}", e)))?;
                Ok(())
            }
            Self::Rpc(tx) => tx
                .send(rpc::RpcCommand::Prompt {
                    prompt: prompt.to_string(),
                    model: model.map(str::to_string),
                })
                .await
                .map_err(|_| EngineError::Stream("rpc session closed".to_string())),
            Self::Closed => Err(EngineError::Stream("process input closed".to_string())),
        }
    }

    /// Request a graceful stop through the input channel, where the
    /// engine has one. Signal-based cancellation is layered on top by the
    /// execution engine.
    pub async fn request_cancel(&mut self) {
        if let Self::Rpc(tx) = self {
            let _ = tx.send(rpc::RpcCommand::Cancel).await;
        }
    }
}

/// A spawned engine subprocess, handed to the execution engine.
pub struct SpawnedProcess {
    pub child: tokio::process::Child,
    pub pid: Option<u32>,
    pub input: ProcessInput,
    /// Normalizable output stream. For stdio engines this is the child's
    /// stdout; for RPC engines it is the session task's forwarded lines.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("child", &self.child)
            .field("pid", &self.pid)
            .field("input", &self.input)
            .field("stdout", &"<dyn AsyncRead>")
            .field("stderr", &self.stderr.as_ref().map(|_| "<dyn AsyncRead>"))
            .finish()
    }
}

#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn engine_type(&self) -> EngineType;

    /// Probe whether the CLI is installed, runnable, and authenticated.
    async fn availability(&self) -> Availability;

    /// Models the engine offers. Empty on failure.
    async fn models(&self) -> Vec<ModelInfo>;

    async fn spawn(
        &self,
        opts: &SpawnOptions,
        env: &HashMap<String, String>,
    ) -> Result<SpawnedProcess, EngineError>;

    /// Start a new process that continues an earlier conversation. Used
    /// for engines that cannot accept input into a finished session.
    async fn spawn_follow_up(
        &self,
        opts: &SpawnOptions,
        env: &HashMap<String, String>,
    ) -> Result<SpawnedProcess, EngineError>;

    /// Map one raw output line to at most one normalized entry. Must be
    /// pure. Unrecognized non-empty lines become system messages carrying
    /// the raw text.
    fn normalize_log_line(&self, raw: &str) -> Option<NormalizedEntry>;
}

// ── Registry ─────────────────────────────────────────────────────────

/// Owns one adapter per engine type plus the probe-result cache.
pub struct EngineRegistry {
    adapters: HashMap<EngineType, Arc<dyn EngineAdapter>>,
    probe_cache: tokio::sync::Mutex<HashMap<EngineType, (Availability, Instant)>>,
}

impl EngineRegistry {
    pub fn with_default_adapters() -> Self {
        let mut adapters: HashMap<EngineType, Arc<dyn EngineAdapter>> = HashMap::new();
        adapters.insert(EngineType::Claude, Arc::new(claude::ClaudeAdapter::new()));
        adapters.insert(EngineType::Gemini, Arc::new(gemini::GeminiAdapter::new()));
        adapters.insert(EngineType::Codex, Arc::new(codex::CodexAdapter::new()));
        adapters.insert(EngineType::Echo, Arc::new(echo::EchoAdapter::new()));
        Self {
            adapters,
            probe_cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, engine: EngineType) -> Result<Arc<dyn EngineAdapter>, EngineError> {
        self.adapters
            .get(&engine)
            .cloned()
            .ok_or_else(|| EngineError::EngineUnavailable {
                engine: engine.to_string(),
                reason: "no adapter registered".to_string(),
            })
    }

    /// Probe availability with the hard time bound and a 10-minute result
    /// cache.
    pub async fn availability(&self, engine: EngineType) -> Availability {
        {
            let cache = self.probe_cache.lock().await;
            if let Some((result, probed_at)) = cache.get(&engine) {
                if probed_at.elapsed() < PROBE_CACHE_TTL {
                    return result.clone();
                }
            }
        }
        let adapter = match self.get(engine) {
            Ok(adapter) => adapter,
            Err(e) => return Availability::missing(e.to_string()),
        };
        let result = match tokio::time::timeout(PROBE_HARD_BOUND, adapter.availability()).await {
            Ok(result) => result,
            Err(_) => Availability::timed_out(),
        };
        self.probe_cache
            .lock()
            .await
            .insert(engine, (result.clone(), Instant::now()));
        result
    }

    pub async fn models(&self, engine: EngineType) -> Vec<ModelInfo> {
        match self.get(engine) {
            Ok(adapter) => adapter.models().await,
            Err(_) => Vec::new(),
        }
    }
}

// ── Environment sanitation ───────────────────────────────────────────

/// Variables forwarded from the parent environment to engine children.
/// Everything else is withheld.
const ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "LANG",
    "LC_ALL",
    "TERM",
    "TMPDIR",
    "XDG_CONFIG_HOME",
    "XDG_DATA_HOME",
    "XDG_CACHE_HOME",
    "ANTHROPIC_API_KEY",
    "CLAUDE_CMD",
    "GEMINI_API_KEY",
    "GEMINI_CMD",
    "OPENAI_API_KEY",
    "CODEX_CMD",
];

/// Build the allow-listed child environment from the parent's.
pub fn safe_env() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(key, _)| ENV_ALLOWLIST.contains(&key.as_str()))
        .collect()
}

/// Resolve a working directory and check it sits inside the workspace
/// root. A root of `/` disables the containment check.
pub fn ensure_within_workspace(
    root: &Path,
    working_dir: &Path,
) -> Result<PathBuf, EngineError> {
    if root == Path::new("/") {
        return Ok(working_dir.to_path_buf());
    }
    let resolved = working_dir.canonicalize().map_err(|e| {
        EngineError::validation(format!(
            "working directory {} is not usable: {}",
            working_dir.display(),
            e
        ))
    })?;
    let root_resolved = root
        .canonicalize()
        .with_context(|| format!("workspace root {} is not usable", root.display()))?;
    if resolved.starts_with(&root_resolved) {
        Ok(resolved)
    } else {
        Err(EngineError::Forbidden(format!(
            "working directory {} is outside the workspace root",
            resolved.display()
        )))
    }
}

// ── Command classification ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandClass {
    Read,
    Search,
    Edit,
    Fetch,
    Other,
}

impl CommandClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Search => "search",
            Self::Edit => "edit",
            Self::Fetch => "fetch",
            Self::Other => "other",
        }
    }
}

const READ_COMMANDS: &[&str] = &[
    "cat", "head", "tail", "less", "more", "ls", "pwd", "stat", "file", "wc", "du", "df",
];
const SEARCH_COMMANDS: &[&str] = &["grep", "rg", "ag", "find", "fd", "locate", "which"];
const EDIT_COMMANDS: &[&str] = &[
    "sed", "awk", "tee", "touch", "mv", "cp", "rm", "mkdir", "rmdir", "chmod", "ln", "patch",
];
const FETCH_COMMANDS: &[&str] = &["curl", "wget"];

/// Classify a shell command by its first token. An output redirection
/// anywhere in the command forces `edit`.
pub fn classify_command(command: &str) -> CommandClass {
    if command.contains('>') {
        return CommandClass::Edit;
    }
    let first = command.split_whitespace().next().unwrap_or("");
    let first = first.rsplit('/').next().unwrap_or(first);
    if READ_COMMANDS.contains(&first) {
        CommandClass::Read
    } else if SEARCH_COMMANDS.contains(&first) {
        CommandClass::Search
    } else if EDIT_COMMANDS.contains(&first) {
        CommandClass::Edit
    } else if FETCH_COMMANDS.contains(&first) {
        CommandClass::Fetch
    } else {
        CommandClass::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_first_token() {
        assert_eq!(classify_command("cat src/main.rs"), CommandClass::Read);
        assert_eq!(classify_command("rg -n TODO src/"), CommandClass::Search);
        assert_eq!(classify_command("sed -i s/a/b/ f.txt"), CommandClass::Edit);
        assert_eq!(classify_command("curl https://example.com"), CommandClass::Fetch);
        assert_eq!(classify_command("cargo build"), CommandClass::Other);
        assert_eq!(classify_command(""), CommandClass::Other);
    }

    #[test]
    fn redirection_forces_edit() {
        assert_eq!(classify_command("cat a.txt > b.txt"), CommandClass::Edit);
        assert_eq!(classify_command("echo hi >> log"), CommandClass::Edit);
    }

    #[test]
    fn absolute_paths_classify_by_basename() {
        assert_eq!(classify_command("/usr/bin/grep foo"), CommandClass::Search);
    }

    #[test]
    fn safe_env_excludes_arbitrary_vars() {
        std::env::set_var("BITK_TEST_SECRET_VALUE", "x");
        let env = safe_env();
        assert!(!env.contains_key("BITK_TEST_SECRET_VALUE"));
        std::env::remove_var("BITK_TEST_SECRET_VALUE");
    }

    #[test]
    fn workspace_root_slash_disables_check() {
        let result =
            ensure_within_workspace(Path::new("/"), Path::new("/nonexistent/anywhere"));
        assert!(result.is_ok());
    }

    #[test]
    fn workspace_containment_enforced() {
        let root = tempfile::tempdir().unwrap();
        let inside = root.path().join("project");
        std::fs::create_dir(&inside).unwrap();
        assert!(ensure_within_workspace(root.path(), &inside).is_ok());

        let outside = tempfile::tempdir().unwrap();
        let err = ensure_within_workspace(root.path(), outside.path()).unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));
    }

    #[test]
    fn registry_resolves_all_engine_types() {
        let registry = EngineRegistry::with_default_adapters();
        for engine in EngineType::all() {
            assert!(registry.get(*engine).is_ok());
        }
    }

    #[tokio::test]
    async fn probe_results_are_cached() {
        let registry = EngineRegistry::with_default_adapters();
        let first = registry.availability(EngineType::Codex).await;
        let again = registry.availability(EngineType::Codex).await;
        assert_eq!(first.executable, again.executable);
        let cache = registry.probe_cache.lock().await;
        assert!(cache.contains_key(&EngineType::Codex));
    }
}
