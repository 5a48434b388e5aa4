//! Codex CLI adapter.
//!
//! Spawning is not wired up yet; the probe reports the binary as not
//! executable so the front-end greys the engine out instead of offering
//! executions that would fail.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::EngineError;
use crate::models::{EngineType, NormalizedEntry};

use super::{
    Availability, AuthStatus, EngineAdapter, ModelInfo, SpawnOptions, SpawnedProcess,
    VERSION_PROBE_TIMEOUT,
};

pub struct CodexAdapter {
    binary: String,
}

impl CodexAdapter {
    pub fn new() -> Self {
        Self {
            binary: std::env::var("CODEX_CMD").unwrap_or_else(|_| "codex".to_string()),
        }
    }
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineAdapter for CodexAdapter {
    fn engine_type(&self) -> EngineType {
        EngineType::Codex
    }

    async fn availability(&self) -> Availability {
        let probe = Command::new(&self.binary)
            .arg("--version")
            .env_clear()
            .envs(super::safe_env())
            .stdin(Stdio::null())
            .output();
        let installed = matches!(
            tokio::time::timeout(VERSION_PROBE_TIMEOUT, probe).await,
            Ok(Ok(output)) if output.status.success()
        );
        Availability {
            installed,
            executable: false,
            version: None,
            auth_status: AuthStatus::Unknown,
            error: Some("codex executions are not supported yet".to_string()),
        }
    }

    async fn models(&self) -> Vec<ModelInfo> {
        Vec::new()
    }

    async fn spawn(
        &self,
        _opts: &SpawnOptions,
        _env: &HashMap<String, String>,
    ) -> Result<SpawnedProcess, EngineError> {
        Err(EngineError::EngineUnavailable {
            engine: EngineType::Codex.to_string(),
            reason: "codex executions are not supported yet".to_string(),
        })
    }

    async fn spawn_follow_up(
        &self,
        opts: &SpawnOptions,
        env: &HashMap<String, String>,
    ) -> Result<SpawnedProcess, EngineError> {
        self.spawn(opts, env).await
    }

    fn normalize_log_line(&self, raw: &str) -> Option<NormalizedEntry> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(NormalizedEntry::raw_system(trimmed))
        }
    }
}
