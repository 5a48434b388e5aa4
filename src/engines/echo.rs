//! Echo engine.
//!
//! A tiny `sh` loop that reflects every prompt back as assistant output
//! and marks each turn with a `[done]` line. Exists so the execution
//! pipeline can be exercised end-to-end without any real AI CLI
//! installed; tests and local smoke runs use it.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;

use crate::errors::EngineError;
use crate::models::{EngineType, LogEntryType, NormalizedEntry};

use super::{
    Availability, AuthStatus, EngineAdapter, ModelInfo, ProcessInput, SpawnOptions,
    SpawnedProcess,
};

const TURN_MARKER: &str = "[done]";
const ERROR_MARKER: &str = "[error]";

// Prompts containing "[slow]" hold the turn open for a couple of
// seconds, which is how tests get a window where the process is busy.
const ECHO_SCRIPT: &str = r#"
case "$BITK_ECHO_PROMPT" in *"[slow]"*) sleep 2 ;; esac
printf '%s\n' "$BITK_ECHO_PROMPT"
printf '[done]\n'
while IFS= read -r line; do
  case "$line" in *"[slow]"*) sleep 2 ;; esac
  printf '%s\n' "$line"
  printf '[done]\n'
done
"#;

pub struct EchoAdapter;

impl EchoAdapter {
    pub fn new() -> Self {
        Self
    }

    async fn spawn_inner(
        &self,
        opts: &SpawnOptions,
        env: &HashMap<String, String>,
    ) -> Result<SpawnedProcess, EngineError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(ECHO_SCRIPT);
        if let Some(dir) = &opts.working_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd
            .env_clear()
            .envs(env)
            .env("BITK_ECHO_PROMPT", &opts.prompt)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::SpawnFailed)?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Stream("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Stream("child stdout unavailable".to_string()))?;
        let stderr = child.stderr.take();
        Ok(SpawnedProcess {
            child,
            pid,
            input: ProcessInput::PlainLines(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as _),
        })
    }
}

impl Default for EchoAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineAdapter for EchoAdapter {
    fn engine_type(&self) -> EngineType {
        EngineType::Echo
    }

    async fn availability(&self) -> Availability {
        Availability {
            installed: true,
            executable: true,
            version: None,
            auth_status: AuthStatus::Authenticated,
            error: None,
        }
    }

    async fn models(&self) -> Vec<ModelInfo> {
        vec![ModelInfo {
            id: "echo".to_string(),
            name: "Echo".to_string(),
            is_default: Some(true),
        }]
    }

    async fn spawn(
        &self,
        opts: &SpawnOptions,
        env: &HashMap<String, String>,
    ) -> Result<SpawnedProcess, EngineError> {
        self.spawn_inner(opts, env).await
    }

    async fn spawn_follow_up(
        &self,
        opts: &SpawnOptions,
        env: &HashMap<String, String>,
    ) -> Result<SpawnedProcess, EngineError> {
        // The echo loop has no session to resume; a follow-up is just a
        // fresh loop fed the new prompt.
        self.spawn_inner(opts, env).await
    }

    fn normalize_log_line(&self, raw: &str) -> Option<NormalizedEntry> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed == TURN_MARKER {
            return Some(
                NormalizedEntry::new(LogEntryType::SystemMessage, "")
                    .with_metadata(json!({"turnCompleted": true})),
            );
        }
        if let Some(rest) = trimmed.strip_prefix(ERROR_MARKER) {
            return Some(
                NormalizedEntry::new(LogEntryType::ErrorMessage, rest.trim()).with_metadata(
                    json!({"isError": true, "resultSubtype": "error_during_execution"}),
                ),
            );
        }
        Some(NormalizedEntry::new(LogEntryType::AssistantMessage, trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoed_line_is_assistant_output() {
        let entry = EchoAdapter::new().normalize_log_line("hello").unwrap();
        assert_eq!(entry.entry_type, LogEntryType::AssistantMessage);
        assert_eq!(entry.content, "hello");
        assert!(!entry.signals_turn_completion());
    }

    #[test]
    fn done_marker_completes_the_turn() {
        let entry = EchoAdapter::new().normalize_log_line("[done]").unwrap();
        assert_eq!(entry.entry_type, LogEntryType::SystemMessage);
        assert!(entry.signals_turn_completion());
        assert!(!entry.is_error_result());
    }

    #[test]
    fn error_marker_flags_logical_failure() {
        let entry = EchoAdapter::new()
            .normalize_log_line("[error] No conversation found")
            .unwrap();
        assert_eq!(entry.entry_type, LogEntryType::ErrorMessage);
        assert_eq!(entry.content, "No conversation found");
        assert!(entry.is_error_result());
        // An error marker also ends the turn via its result subtype.
        assert!(entry.signals_turn_completion());
    }

    #[test]
    fn blank_lines_are_dropped() {
        assert!(EchoAdapter::new().normalize_log_line("   ").is_none());
    }
}
