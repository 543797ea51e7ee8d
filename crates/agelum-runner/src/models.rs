use crate::resolver::SearchPath;
use agelum_core::{AgentError, ToolCatalog};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

pub const MODEL_LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-tool memoized model lists. A failed listing is cached as empty and is
/// not retried for the lifetime of the catalog.
pub struct ModelCatalog {
    tools: Arc<ToolCatalog>,
    search: SearchPath,
    timeout: Duration,
    cache: StdMutex<HashMap<String, Arc<OnceCell<Vec<String>>>>>,
}

impl ModelCatalog {
    pub fn new(tools: Arc<ToolCatalog>, search: SearchPath) -> Self {
        Self {
            tools,
            search,
            timeout: MODEL_LIST_TIMEOUT,
            cache: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn get_models(&self, tool_name: &str) -> Vec<String> {
        let Some(tool) = self.tools.get(tool_name) else {
            return Vec::new();
        };
        if let Some(models) = &tool.models {
            return models.clone();
        }
        let Some(listing) = tool.list_models_command.clone() else {
            return Vec::new();
        };

        let cell = self.cell(tool_name);
        cell.get_or_init(|| async {
            match self.list(tool_name, &listing).await {
                Ok(models) => {
                    debug!(event = "models_listed", tool = tool_name, count = models.len());
                    models
                }
                Err(err) => {
                    warn!(event = "models_unavailable", tool = tool_name, error = %err);
                    Vec::new()
                }
            }
        })
        .await
        .clone()
    }

    fn cell(&self, tool_name: &str) -> Arc<OnceCell<Vec<String>>> {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache
            .entry(tool_name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    async fn list(&self, tool_name: &str, listing: &str) -> Result<Vec<String>, AgentError> {
        let unavailable = |reason: String| AgentError::ModelListUnavailable {
            tool: tool_name.to_string(),
            reason,
        };
        let tokens = shell_words::split(listing).map_err(|err| unavailable(err.to_string()))?;
        let Some((program, args)) = tokens.split_first() else {
            return Err(unavailable("empty listing command".to_string()));
        };

        let mut command = Command::new(self.search.resolve_path(program));
        command
            .args(args)
            .env("PATH", self.search.to_env_value())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| unavailable(format!("timed out after {:?}", self.timeout)))?
            .map_err(|err| unavailable(err.to_string()))?;
        if !output.status.success() {
            return Err(unavailable(format!("exited with {}", output.status)));
        }
        Ok(parse_model_listing(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// One model per line; blank lines and `#` comments are dropped.
pub fn parse_model_listing(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
