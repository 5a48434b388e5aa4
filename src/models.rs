use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Issue lifecycle enums ────────────────────────────────────────────

/// Kanban column an issue lives in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Todo,
    Working,
    Review,
    Done,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Working => "working",
            Self::Review => "review",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "working" => Ok(Self::Working),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid issue status: {}", s)),
        }
    }
}

/// Status of the AI session attached to an issue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// How much autonomy the engine subprocess gets over tool calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    Auto,
    Supervised,
    Plan,
    Bypass,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Supervised => "supervised",
            Self::Plan => "plan",
            Self::Bypass => "bypass",
        }
    }
}

impl Default for PermissionMode {
    fn default() -> Self {
        Self::Auto
    }
}

/// What a follow-up should do when a process is already busy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BusyAction {
    Queue,
    Cancel,
}

impl Default for BusyAction {
    fn default() -> Self {
        Self::Queue
    }
}

/// Supported AI CLI engines.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
    Claude,
    Gemini,
    Codex,
    Echo,
}

impl EngineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Codex => "codex",
            Self::Echo => "echo",
        }
    }

    pub fn all() -> &'static [EngineType] {
        &[Self::Claude, Self::Gemini, Self::Codex, Self::Echo]
    }
}

impl std::fmt::Display for EngineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Self::Claude),
            "gemini" => Ok(Self::Gemini),
            "codex" => Ok(Self::Codex),
            "echo" => Ok(Self::Echo),
            _ => Err(format!("Unknown engine type: {}", s)),
        }
    }
}

// ── Log entries ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LogEntryType {
    UserMessage,
    AssistantMessage,
    ToolUse,
    SystemMessage,
    ErrorMessage,
    Thinking,
    Loading,
    TokenUsage,
}

impl LogEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserMessage => "user-message",
            Self::AssistantMessage => "assistant-message",
            Self::ToolUse => "tool-use",
            Self::SystemMessage => "system-message",
            Self::ErrorMessage => "error-message",
            Self::Thinking => "thinking",
            Self::Loading => "loading",
            Self::TokenUsage => "token-usage",
        }
    }
}

impl std::fmt::Display for LogEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogEntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user-message" => Ok(Self::UserMessage),
            "assistant-message" => Ok(Self::AssistantMessage),
            "tool-use" => Ok(Self::ToolUse),
            "system-message" => Ok(Self::SystemMessage),
            "error-message" => Ok(Self::ErrorMessage),
            "thinking" => Ok(Self::Thinking),
            "loading" => Ok(Self::Loading),
            "token-usage" => Ok(Self::TokenUsage),
            _ => Err(format!("Invalid log entry type: {}", s)),
        }
    }
}

/// What a tool call did, condensed for the UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ToolAction {
    FileRead {
        path: String,
    },
    FileEdit {
        path: String,
    },
    CommandRun {
        command: String,
    },
    Search {
        query: String,
    },
    WebFetch {
        url: String,
    },
    Tool {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Other {
        description: String,
    },
}

/// A persisted, ordered log entry for an issue. Serializes to the wire
/// shape consumed by SSE clients and the log endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(rename = "messageId")]
    pub id: i64,
    pub issue_id: String,
    pub turn_index: i64,
    pub entry_index: i64,
    pub entry_type: LogEntryType,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_action: Option<ToolAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub visible: bool,
}

impl LogEntry {
    fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }

    /// Pending user messages are queued input awaiting dispatch.
    pub fn is_pending(&self) -> bool {
        self.entry_type == LogEntryType::UserMessage
            && self.visible
            && self.metadata_str("type") == Some("pending")
    }

    /// Entries tagged as system-initiated (meta turns) are hidden from
    /// the default client view.
    pub fn is_system_tagged(&self) -> bool {
        self.metadata_str("type") == Some("system")
    }
}

/// A single normalized entry produced by an engine adapter from one raw
/// output line. The execution layer stamps turn and entry indices before
/// persisting it.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEntry {
    pub entry_type: LogEntryType,
    pub content: String,
    pub timestamp: Option<String>,
    pub metadata: Option<Value>,
    pub tool_action: Option<ToolAction>,
}

impl NormalizedEntry {
    pub fn new(entry_type: LogEntryType, content: impl Into<String>) -> Self {
        Self {
            entry_type,
            content: content.into(),
            timestamp: None,
            metadata: None,
            tool_action: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_tool_action(mut self, action: ToolAction) -> Self {
        self.tool_action = Some(action);
        self
    }

    /// System message carrying the raw text of a line the adapter did not
    /// recognize.
    pub fn raw_system(line: &str) -> Self {
        Self::new(LogEntryType::SystemMessage, line)
    }

    fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref()?.get(key)
    }

    /// Whether this entry ends the current turn. True if the adapter set
    /// `turnCompleted`, reported a result subtype, or emitted a system
    /// message carrying a duration.
    pub fn signals_turn_completion(&self) -> bool {
        if self
            .metadata_value("turnCompleted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return true;
        }
        if self.metadata_value("resultSubtype").is_some() {
            return true;
        }
        self.entry_type == LogEntryType::SystemMessage
            && self.metadata_value("duration").is_some()
    }

    pub fn result_subtype(&self) -> Option<&str> {
        self.metadata_value("resultSubtype")?.as_str()
    }

    /// External session id announced by the engine, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.metadata_value("sessionId")?.as_str()
    }

    /// Slash commands advertised in an engine init message.
    pub fn slash_commands(&self) -> Option<Vec<String>> {
        let list = self.metadata_value("slashCommands")?.as_array()?;
        Some(
            list.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )
    }

    /// Whether the adapter flagged this entry as an in-stream failure.
    pub fn is_error_result(&self) -> bool {
        self.metadata_value("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || self
                .result_subtype()
                .map(|s| s.starts_with("error"))
                .unwrap_or(false)
    }
}

// ── Persisted entities ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub alias: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: String,
    pub project_id: String,
    pub status: IssueStatus,
    pub issue_number: i64,
    pub title: String,
    pub priority: Priority,
    pub sort_order: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_issue_id: Option<String>,
    pub use_worktree: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_type: Option<EngineType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_status: Option<SessionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_commit_hash: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub is_deleted: bool,
}

/// Generate a fresh opaque id for projects, issues, and executions.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Current UTC time in ISO-8601 with millisecond precision.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_enums_roundtrip() {
        for s in &["todo", "working", "review", "done"] {
            let parsed: IssueStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        for s in &["pending", "running", "completed", "failed"] {
            let parsed: SessionStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("archived".parse::<IssueStatus>().is_err());
    }

    #[test]
    fn entry_types_use_kebab_case_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&LogEntryType::UserMessage).unwrap(),
            "\"user-message\""
        );
        assert_eq!(
            serde_json::to_string(&LogEntryType::TokenUsage).unwrap(),
            "\"token-usage\""
        );
        assert_eq!(
            serde_json::from_str::<LogEntryType>("\"error-message\"").unwrap(),
            LogEntryType::ErrorMessage
        );
    }

    #[test]
    fn tool_action_serializes_tagged() {
        let action = ToolAction::CommandRun {
            command: "cargo test".into(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"], "command-run");
        assert_eq!(json["command"], "cargo test");

        let action = ToolAction::Tool {
            tool_name: "WebSearch".into(),
            description: None,
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"], "tool");
        assert_eq!(json["toolName"], "WebSearch");
    }

    #[test]
    fn turn_completion_inference_rules() {
        let explicit = NormalizedEntry::new(LogEntryType::AssistantMessage, "done")
            .with_metadata(serde_json::json!({"turnCompleted": true}));
        assert!(explicit.signals_turn_completion());

        let subtype = NormalizedEntry::new(LogEntryType::SystemMessage, "")
            .with_metadata(serde_json::json!({"resultSubtype": "success"}));
        assert!(subtype.signals_turn_completion());

        let duration = NormalizedEntry::new(LogEntryType::SystemMessage, "")
            .with_metadata(serde_json::json!({"duration": 1200}));
        assert!(duration.signals_turn_completion());

        // Duration only counts on system messages.
        let not_system = NormalizedEntry::new(LogEntryType::AssistantMessage, "")
            .with_metadata(serde_json::json!({"duration": 1200}));
        assert!(!not_system.signals_turn_completion());

        let plain = NormalizedEntry::new(LogEntryType::AssistantMessage, "hello");
        assert!(!plain.signals_turn_completion());
    }

    #[test]
    fn error_result_detection() {
        let flagged = NormalizedEntry::new(LogEntryType::SystemMessage, "")
            .with_metadata(serde_json::json!({"isError": true}));
        assert!(flagged.is_error_result());

        let subtype = NormalizedEntry::new(LogEntryType::SystemMessage, "")
            .with_metadata(serde_json::json!({"resultSubtype": "error_during_execution"}));
        assert!(subtype.is_error_result());

        let success = NormalizedEntry::new(LogEntryType::SystemMessage, "")
            .with_metadata(serde_json::json!({"resultSubtype": "success"}));
        assert!(!success.is_error_result());
    }

    #[test]
    fn pending_detection_requires_visible_user_message() {
        let mut entry = LogEntry {
            id: 1,
            issue_id: "iss".into(),
            turn_index: 0,
            entry_index: 0,
            entry_type: LogEntryType::UserMessage,
            content: "hi".into(),
            metadata: Some(serde_json::json!({"type": "pending"})),
            tool_action: None,
            reply_to_message_id: None,
            timestamp: None,
            visible: true,
        };
        assert!(entry.is_pending());
        entry.visible = false;
        assert!(!entry.is_pending());
        entry.visible = true;
        entry.entry_type = LogEntryType::SystemMessage;
        assert!(!entry.is_pending());
    }

    #[test]
    fn log_entry_wire_shape_uses_message_id() {
        let entry = LogEntry {
            id: 42,
            issue_id: "iss".into(),
            turn_index: 1,
            entry_index: 3,
            entry_type: LogEntryType::AssistantMessage,
            content: "hi".into(),
            metadata: None,
            tool_action: None,
            reply_to_message_id: None,
            timestamp: None,
            visible: true,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["messageId"], 42);
        assert_eq!(json["entryType"], "assistant-message");
        assert_eq!(json["turnIndex"], 1);
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn new_ids_are_short_and_unique() {
        let a = new_id();
        let b = new_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }
}
