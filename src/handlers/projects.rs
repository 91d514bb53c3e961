use super::HandlerContext;
use crate::errors::{OxiclawError, OxiclawResult};
use crate::utils::subprocess::run_command;
use crate::utils::truncate_utf8;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// CLI stdout beyond this is cut before replying to chat.
const REPLY_MAX_CHARS: usize = 8000;
const CLI_MAX_OUTPUT: usize = 1024 * 1024;

/// The external-project registry at `data/sugar-projects.json`:
/// `{"projects": {"name": "/path/to/checkout"}}`.
#[derive(Debug, Default, Deserialize)]
pub struct ProjectRegistry {
    #[serde(default)]
    pub projects: HashMap<String, PathBuf>,
}

pub fn load_projects(path: &Path) -> ProjectRegistry {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("project registry {} unparseable: {}", path.display(), e);
            ProjectRegistry::default()
        }),
        Err(_) => ProjectRegistry::default(),
    }
}

fn format_cli_reply(assistant: &str, stdout: &str, stderr: &str, exit_code: Option<i32>) -> String {
    let body = if exit_code == Some(0) {
        if stdout.trim().is_empty() {
            "(no output)".to_string()
        } else {
            stdout.trim().to_string()
        }
    } else {
        let detail = if stderr.trim().is_empty() {
            stdout.trim()
        } else {
            stderr.trim()
        };
        format!("command exited {:?}: {}", exit_code, detail)
    };
    format!("{}: {}", assistant, truncate_utf8(&body, REPLY_MAX_CHARS))
}

impl HandlerContext {
    /// `github_cli`: run the GitHub CLI with an argv list and reply with its
    /// output. User-supplied content is only ever an argument.
    pub(super) async fn handle_github(
        &self,
        source_group: &str,
        is_main: bool,
        chat_jid: &str,
        args: &[String],
    ) -> OxiclawResult<()> {
        self.authorize_chat(source_group, chat_jid, is_main).await?;
        if args.is_empty() {
            return Err(OxiclawError::InvalidPayload(
                "github_cli needs arguments".to_string(),
            ));
        }

        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = run_command(
            &self.tools.github_bin,
            &argv,
            None,
            Duration::from_secs(self.tools.cli_timeout_secs),
            CLI_MAX_OUTPUT,
        )
        .await
        .map_err(OxiclawError::Internal)?;

        info!(
            "github_cli for '{}' exited {:?} ({} bytes out)",
            source_group,
            output.exit_code,
            output.stdout.len()
        );
        let reply = format_cli_reply(
            self.adapter.assistant_name(),
            &output.stdout,
            &output.stderr,
            output.exit_code,
        );
        self.adapter
            .send_as_assistant(chat_jid, &reply)
            .await
            .map_err(|e| OxiclawError::Transport(e.to_string()))
    }

    /// `sugar_cli`: run the project tool inside a registered project
    /// checkout. Unknown project names are rejected, never shell-resolved.
    pub(super) async fn handle_sugar(
        &self,
        source_group: &str,
        is_main: bool,
        chat_jid: &str,
        project: &str,
        args: &[String],
    ) -> OxiclawResult<()> {
        self.authorize_chat(source_group, chat_jid, is_main).await?;

        let registry = load_projects(&self.paths.projects_file());
        let Some(project_dir) = registry.projects.get(project) else {
            return Err(OxiclawError::InvalidPayload(format!(
                "unknown project '{project}'"
            )));
        };
        if !project_dir.is_dir() {
            return Err(OxiclawError::InvalidPayload(format!(
                "project '{}' path {} is not a directory",
                project,
                project_dir.display()
            )));
        }

        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = run_command(
            &self.tools.sugar_bin,
            &argv,
            Some(project_dir),
            Duration::from_secs(self.tools.cli_timeout_secs),
            CLI_MAX_OUTPUT,
        )
        .await
        .map_err(OxiclawError::Internal)?;

        info!(
            "sugar_cli '{}' in project '{}' exited {:?}",
            source_group, project, output.exit_code
        );
        let reply = format_cli_reply(
            self.adapter.assistant_name(),
            &output.stdout,
            &output.stderr,
            output.exit_code,
        );
        self.adapter
            .send_as_assistant(chat_jid, &reply)
            .await
            .map_err(|e| OxiclawError::Transport(e.to_string()))
    }
}
