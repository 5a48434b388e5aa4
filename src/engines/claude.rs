//! Claude Code CLI adapter.
//!
//! Talks stream-json on both stdin and stdout, so a running process
//! accepts follow-up user messages without restarting. Session continuity
//! across restarts uses `--resume` with the stored external session id.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::errors::EngineError;
use crate::models::{
    EngineType, LogEntryType, NormalizedEntry, PermissionMode, ToolAction,
};

use super::{
    classify_command, Availability, AuthStatus, EngineAdapter, ModelInfo, ProcessInput,
    SpawnOptions, SpawnedProcess, VERSION_PROBE_TIMEOUT,
};

pub struct ClaudeAdapter {
    binary: String,
}

impl ClaudeAdapter {
    pub fn new() -> Self {
        Self {
            binary: std::env::var("CLAUDE_CMD").unwrap_or_else(|_| "claude".to_string()),
        }
    }

    fn build_command(
        &self,
        opts: &SpawnOptions,
        env: &HashMap<String, String>,
        resume: bool,
    ) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args([
            "--print",
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
        ]);
        match opts.permission_mode {
            PermissionMode::Auto => {
                cmd.args(["--permission-mode", "acceptEdits"]);
            }
            PermissionMode::Supervised => {}
            PermissionMode::Plan => {
                cmd.args(["--permission-mode", "plan"]);
            }
            PermissionMode::Bypass => {
                cmd.arg("--dangerously-skip-permissions");
            }
        }
        if let Some(model) = &opts.model {
            cmd.args(["--model", model]);
        }
        if resume {
            if let Some(session_id) = &opts.external_session_id {
                cmd.args(["--resume", session_id]);
            }
        }
        if let Some(dir) = &opts.working_dir {
            cmd.current_dir(dir);
        }
        cmd.env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn spawn_inner(
        &self,
        opts: &SpawnOptions,
        env: &HashMap<String, String>,
        resume: bool,
    ) -> Result<SpawnedProcess, EngineError> {
        let mut cmd = self.build_command(opts, env, resume);
        let mut child = cmd.spawn().map_err(EngineError::SpawnFailed)?;
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

        let mut input = ProcessInput::JsonLines(stdin);
        input.send_user_message(&opts.prompt, None).await?;

        Ok(SpawnedProcess {
            child,
            pid,
            input,
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as _),
        })
    }
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineAdapter for ClaudeAdapter {
    fn engine_type(&self) -> EngineType {
        EngineType::Claude
    }

    async fn availability(&self) -> Availability {
        let probe = Command::new(&self.binary)
            .arg("--version")
            .env_clear()
            .envs(super::safe_env())
            .stdin(Stdio::null())
            .output();
        match tokio::time::timeout(VERSION_PROBE_TIMEOUT, probe).await {
            Ok(Ok(output)) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let auth_status = if std::env::var("ANTHROPIC_API_KEY").is_ok() {
                    AuthStatus::Authenticated
                } else {
                    AuthStatus::Unknown
                };
                Availability {
                    installed: true,
                    executable: true,
                    version: Some(version),
                    auth_status,
                    error: None,
                }
            }
            Ok(Ok(output)) => Availability {
                installed: true,
                executable: false,
                version: None,
                auth_status: AuthStatus::Unknown,
                error: Some(format!(
                    "version probe exited with {}",
                    output.status.code().unwrap_or(-1)
                )),
            },
            Ok(Err(e)) => Availability::missing(format!("{} not runnable: {}", self.binary, e)),
            Err(_) => Availability::timed_out(),
        }
    }

    async fn models(&self) -> Vec<ModelInfo> {
        vec![
            ModelInfo {
                id: "sonnet".to_string(),
                name: "Claude Sonnet".to_string(),
                is_default: Some(true),
            },
            ModelInfo {
                id: "opus".to_string(),
                name: "Claude Opus".to_string(),
                is_default: None,
            },
            ModelInfo {
                id: "haiku".to_string(),
                name: "Claude Haiku".to_string(),
                is_default: None,
            },
        ]
    }

    async fn spawn(
        &self,
        opts: &SpawnOptions,
        env: &HashMap<String, String>,
    ) -> Result<SpawnedProcess, EngineError> {
        self.spawn_inner(opts, env, false).await
    }

    async fn spawn_follow_up(
        &self,
        opts: &SpawnOptions,
        env: &HashMap<String, String>,
    ) -> Result<SpawnedProcess, EngineError> {
        self.spawn_inner(opts, env, true).await
    }

    fn normalize_log_line(&self, raw: &str) -> Option<NormalizedEntry> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let event: StreamEvent = match serde_json::from_str(trimmed) {
            Ok(event) => event,
            Err(_) => return Some(NormalizedEntry::raw_system(trimmed)),
        };
        normalize_event(event, trimmed)
    }
}

/// Events from the CLI's stream-json output format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "system")]
    System {
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        slash_commands: Vec<String>,
        #[serde(default)]
        model: Option<String>,
    },

    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "result")]
    Result {
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        usage: Option<Value>,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },

    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },

    #[serde(other)]
    Other,
}

fn normalize_event(event: StreamEvent, raw: &str) -> Option<NormalizedEntry> {
    match event {
        StreamEvent::System {
            subtype,
            session_id,
            slash_commands,
            model,
        } => {
            let mut metadata = json!({"subtype": subtype});
            if let Some(session_id) = session_id {
                metadata["sessionId"] = json!(session_id);
            }
            if !slash_commands.is_empty() {
                metadata["slashCommands"] = json!(slash_commands);
            }
            if let Some(model) = model {
                metadata["model"] = json!(model);
            }
            let content = if subtype == "init" {
                "Session started".to_string()
            } else {
                format!("System: {}", subtype)
            };
            Some(
                NormalizedEntry::new(LogEntryType::SystemMessage, content)
                    .with_metadata(metadata),
            )
        }
        StreamEvent::Assistant { message } => {
            message.content.into_iter().find_map(normalize_block)
        }
        // Tool results echoed back as user events carry nothing the log
        // needs beyond the tool-use entry already emitted.
        StreamEvent::User {} => None,
        StreamEvent::Result {
            subtype,
            result,
            is_error,
            duration_ms,
            usage,
        } => {
            let mut metadata = json!({
                "resultSubtype": subtype,
                "isError": is_error,
                "turnCompleted": true,
            });
            if let Some(duration) = duration_ms {
                metadata["duration"] = json!(duration);
            }
            if let Some(usage) = usage {
                metadata["usage"] = usage;
            }
            Some(
                NormalizedEntry::new(
                    LogEntryType::SystemMessage,
                    result.unwrap_or_default(),
                )
                .with_metadata(metadata),
            )
        }
        StreamEvent::Unknown => Some(NormalizedEntry::raw_system(raw)),
    }
}

fn normalize_block(block: ContentBlock) -> Option<NormalizedEntry> {
    match block {
        ContentBlock::Text { text } => {
            Some(NormalizedEntry::new(LogEntryType::AssistantMessage, text))
        }
        ContentBlock::Thinking { thinking } => {
            Some(NormalizedEntry::new(LogEntryType::Thinking, thinking))
        }
        ContentBlock::ToolUse { name, input } => {
            let (content, action, metadata) = describe_tool_use(&name, &input);
            let mut entry =
                NormalizedEntry::new(LogEntryType::ToolUse, content).with_tool_action(action);
            if let Some(metadata) = metadata {
                entry = entry.with_metadata(metadata);
            }
            Some(entry)
        }
        ContentBlock::Other => None,
    }
}

/// Condense a tool call into display text plus a structured action.
fn describe_tool_use(name: &str, input: &Value) -> (String, ToolAction, Option<Value>) {
    let str_field = |key: &str| input.get(key).and_then(Value::as_str).unwrap_or("");
    match name {
        "Read" => {
            let path = str_field("file_path");
            (
                format!("Reading {}", shorten_path(path)),
                ToolAction::FileRead { path: path.into() },
                None,
            )
        }
        "Write" | "Edit" | "MultiEdit" | "NotebookEdit" => {
            let path = str_field("file_path");
            (
                format!("Editing {}", shorten_path(path)),
                ToolAction::FileEdit { path: path.into() },
                None,
            )
        }
        "Bash" => {
            let command = str_field("command");
            let class = classify_command(command);
            (
                format!("Running {}", truncate_str(command, 80)),
                ToolAction::CommandRun {
                    command: command.into(),
                },
                Some(json!({"commandClass": class.as_str()})),
            )
        }
        "Grep" | "Glob" => {
            let query = str_field("pattern");
            (
                format!("Searching {}", truncate_str(query, 60)),
                ToolAction::Search {
                    query: query.into(),
                },
                None,
            )
        }
        "WebSearch" => {
            let query = str_field("query");
            (
                format!("Searching the web for {}", truncate_str(query, 60)),
                ToolAction::Search {
                    query: query.into(),
                },
                None,
            )
        }
        "WebFetch" => {
            let url = str_field("url");
            (
                format!("Fetching {}", url),
                ToolAction::WebFetch { url: url.into() },
                None,
            )
        }
        "Task" => {
            let description = str_field("description");
            (
                format!("Agent task: {}", description),
                ToolAction::Tool {
                    tool_name: name.into(),
                    description: Some(description.into()),
                },
                None,
            )
        }
        _ => (
            name.to_string(),
            ToolAction::Tool {
                tool_name: name.into(),
                description: None,
            },
            None,
        ),
    }
}

/// Shorten a file path to its last two components.
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

fn truncate_str(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let cut = s
            .char_indices()
            .take_while(|(i, _)| *i <= max_len - 3)
            .last()
            .map(|(i, _)| i)
            .unwrap_or(0);
        format!("{}...", &s[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> ClaudeAdapter {
        ClaudeAdapter::new()
    }

    #[test]
    fn init_message_carries_session_and_slash_commands() {
        let line = r#"{"type":"system","subtype":"init","session_id":"sess-1","slash_commands":["/compact","/review"],"model":"sonnet"}"#;
        let entry = adapter().normalize_log_line(line).unwrap();
        assert_eq!(entry.entry_type, LogEntryType::SystemMessage);
        assert_eq!(entry.session_id(), Some("sess-1"));
        assert_eq!(
            entry.slash_commands().unwrap(),
            vec!["/compact".to_string(), "/review".to_string()]
        );
        assert!(!entry.signals_turn_completion());
    }

    #[test]
    fn assistant_text_becomes_assistant_message() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello there"}]}}"#;
        let entry = adapter().normalize_log_line(line).unwrap();
        assert_eq!(entry.entry_type, LogEntryType::AssistantMessage);
        assert_eq!(entry.content, "Hello there");
    }

    #[test]
    fn tool_use_maps_to_tool_action() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"grep -r foo ."}}]}}"#;
        let entry = adapter().normalize_log_line(line).unwrap();
        assert_eq!(entry.entry_type, LogEntryType::ToolUse);
        assert_eq!(
            entry.tool_action,
            Some(ToolAction::CommandRun {
                command: "grep -r foo .".into()
            })
        );
        assert_eq!(
            entry.metadata.as_ref().unwrap()["commandClass"],
            "search"
        );

        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/a/b/c/d.rs"}}]}}"#;
        let entry = adapter().normalize_log_line(line).unwrap();
        assert_eq!(
            entry.tool_action,
            Some(ToolAction::FileRead {
                path: "/a/b/c/d.rs".into()
            })
        );
        assert_eq!(entry.content, "Reading c/d.rs");
    }

    #[test]
    fn result_signals_turn_completion() {
        let line = r#"{"type":"result","subtype":"success","result":"All done","is_error":false,"duration_ms":5120}"#;
        let entry = adapter().normalize_log_line(line).unwrap();
        assert_eq!(entry.entry_type, LogEntryType::SystemMessage);
        assert_eq!(entry.content, "All done");
        assert!(entry.signals_turn_completion());
        assert!(!entry.is_error_result());
        assert_eq!(entry.result_subtype(), Some("success"));
    }

    #[test]
    fn error_result_is_flagged() {
        let line = r#"{"type":"result","subtype":"error_during_execution","is_error":true}"#;
        let entry = adapter().normalize_log_line(line).unwrap();
        assert!(entry.signals_turn_completion());
        assert!(entry.is_error_result());
    }

    #[test]
    fn tool_result_echo_is_skipped() {
        let line = r#"{"type":"user","tool_use_result":{"file":{"filePath":"/x"}}}"#;
        assert!(adapter().normalize_log_line(line).is_none());
    }

    #[test]
    fn unrecognized_line_becomes_raw_system_message() {
        let entry = adapter().normalize_log_line("npm WARN deprecated").unwrap();
        assert_eq!(entry.entry_type, LogEntryType::SystemMessage);
        assert_eq!(entry.content, "npm WARN deprecated");
        assert!(adapter().normalize_log_line("   ").is_none());
    }

    #[test]
    fn thinking_block_normalizes() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"pondering"}]}}"#;
        let entry = adapter().normalize_log_line(line).unwrap();
        assert_eq!(entry.entry_type, LogEntryType::Thinking);
        assert_eq!(entry.content, "pondering");
    }
}
