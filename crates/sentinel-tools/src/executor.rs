//! Tool executor.
//!
//! Dispatches tool-call steps with policy validation before every
//! operation. The tool set is closed: file_write, file_read, mkdir, shell,
//! workspace_clean, and the container tools. Required arguments are
//! validated and unknown extra arguments rejected before any side effect.
//!
//! Provenance contract:
//! - `file_write` records the written file's provenance, derived from the
//!   content's data ids, so a later `file_read` inherits the writer's
//!   trust through the chain.
//! - `shell` and the container tools refuse any path argument whose
//!   recorded writer has untrusted provenance (the filesystem half of the
//!   trust gate — writing an untrusted script is allowed, executing it is
//!   not).
//!
//! Failure semantics: a policy denial is a terminal block for the step;
//! transient I/O errors surface as step failures with no retry.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use sentinel_security::policy::{shell_tokens, PolicyEngine};
use sentinel_types::errors::SentinelError;
use sentinel_types::models::{DataSource, PathOperation, PolicyDecision, TaggedData, TrustLevel};
use sentinel_types::traits::{ProvenanceStore, ToolDescription};

/// Timeout for shell commands.
const SHELL_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for container builds.
const CONTAINER_BUILD_TIMEOUT: Duration = Duration::from_secs(300);
/// Timeout for container run/stop.
const CONTAINER_TIMEOUT: Duration = Duration::from_secs(60);

/// Container flags that must never be passed, even if the tool interface
/// is extended: host mounts, port publishing, privilege, and namespace
/// sharing.
const DANGEROUS_CONTAINER_FLAG_NAMES: &[&str] = &[
    "-v",
    "--volume",
    "--mount",
    "-p",
    "--publish",
    "--privileged",
    "--cap-add",
    "--security-opt",
    "--device",
];
const DANGEROUS_CONTAINER_FLAG_VALUES: &[&str] = &[
    "--network=host",
    "--net=host",
    "--pid=host",
    "--ipc=host",
    "--userns=host",
];

/// Why a tool call did not produce output.
#[derive(Debug)]
pub enum ToolFailure {
    /// Policy or trust gate refused the call. Terminal for the step.
    Blocked {
        /// Attribution (e.g. "policy:blocked_command:rm_rf",
        /// "provenance_trust_gate").
        rule_id: String,
        reason: String,
    },
    /// Validation or I/O failure.
    Error(SentinelError),
}

impl From<SentinelError> for ToolFailure {
    fn from(err: SentinelError) -> Self {
        ToolFailure::Error(err)
    }
}

impl ToolFailure {
    fn blocked(rule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        ToolFailure::Blocked {
            rule_id: rule_id.into(),
            reason: reason.into(),
        }
    }
}

/// Executes tool actions with policy checks before every operation.
pub struct ToolExecutor {
    engine: Arc<PolicyEngine>,
    provenance: Arc<dyn ProvenanceStore>,
    workspace_root: PathBuf,
    container_runtime: String,
}

impl ToolExecutor {
    pub fn new(engine: Arc<PolicyEngine>, provenance: Arc<dyn ProvenanceStore>) -> Self {
        let workspace_root = engine.workspace_root().to_path_buf();
        Self {
            engine,
            provenance,
            workspace_root,
            container_runtime: "podman".to_string(),
        }
    }

    /// Tool names the planner may reference.
    pub fn known_tools(&self) -> Vec<String> {
        self.descriptions().into_iter().map(|d| d.name).collect()
    }

    /// Tool catalog surfaced to the planner.
    pub fn descriptions(&self) -> Vec<ToolDescription> {
        let tool = |name: &str, description: &str, args: &[(&str, &str)]| ToolDescription {
            name: name.to_string(),
            description: description.to_string(),
            args: args
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };

        vec![
            tool(
                "file_write",
                "Write content to a file at the given path",
                &[("path", "string"), ("content", "string")],
            ),
            tool(
                "file_read",
                "Read the contents of a file",
                &[("path", "string")],
            ),
            tool(
                "mkdir",
                "Create a directory (and parents)",
                &[("path", "string")],
            ),
            tool(
                "shell",
                "Run a constrained shell command and return its output",
                &[("command", "string")],
            ),
            tool(
                "workspace_clean",
                "Remove every file and directory inside the workspace",
                &[],
            ),
            tool(
                "container_build",
                "Build a container image from a context directory",
                &[("context_path", "string"), ("tag", "string")],
            ),
            tool(
                "container_run",
                "Run a container from an image",
                &[("image", "string"), ("name", "string")],
            ),
            tool(
                "container_stop",
                "Stop a running container",
                &[("container_name", "string")],
            ),
        ]
    }

    /// Whether a tool can cause execution of data it is given. The
    /// orchestrator's variable trust gate applies to these; pure data
    /// sinks (file_write, mkdir) instead record provenance and let the
    /// gate fire when the data is later executed or read into an
    /// execution path.
    pub fn is_execution_sink(&self, tool: &str) -> bool {
        matches!(
            tool,
            "shell" | "container_build" | "container_run" | "container_stop"
        )
    }

    /// Execute a tool by name.
    ///
    /// `arg_data_ids` carries the provenance ids of any variable-
    /// substituted argument content; they become the parents of data this
    /// call persists.
    pub async fn execute(
        &self,
        tool_name: &str,
        args: &BTreeMap<String, serde_json::Value>,
        arg_data_ids: &[String],
    ) -> Result<TaggedData, ToolFailure> {
        info!(
            event = "tool_execute",
            tool = tool_name,
            args_keys = ?args.keys().collect::<Vec<_>>(),
        );

        match tool_name {
            "file_write" => {
                self.validate_args(tool_name, args, &["path", "content"], &[])?;
                self.file_write(args, arg_data_ids).await
            }
            "file_read" => {
                self.validate_args(tool_name, args, &["path"], &[])?;
                self.file_read(args).await
            }
            "mkdir" => {
                self.validate_args(tool_name, args, &["path"], &[])?;
                self.mkdir(args).await
            }
            "shell" => {
                self.validate_args(tool_name, args, &["command"], &[])?;
                self.shell(args).await
            }
            "workspace_clean" => {
                self.validate_args(tool_name, args, &[], &[])?;
                self.workspace_clean().await
            }
            "container_build" => {
                self.validate_args(tool_name, args, &["context_path", "tag"], &[])?;
                let context_path = str_arg(args, "context_path")?;
                let tag = str_arg(args, "tag")?;
                let cmd = vec![
                    self.container_runtime.clone(),
                    "build".to_string(),
                    context_path,
                    "-t".to_string(),
                    tag,
                ];
                self.run_container_command(cmd, CONTAINER_BUILD_TIMEOUT, "container_build")
                    .await
            }
            "container_run" => {
                self.validate_args(tool_name, args, &["image", "name"], &[])?;
                let image = str_arg(args, "image")?;
                let name = str_arg(args, "name")?;
                let cmd = vec![
                    self.container_runtime.clone(),
                    "run".to_string(),
                    "--name".to_string(),
                    name,
                    "-d".to_string(),
                    image,
                ];
                self.run_container_command(cmd, CONTAINER_TIMEOUT, "container_run")
                    .await
            }
            "container_stop" => {
                self.validate_args(tool_name, args, &["container_name"], &[])?;
                let name = str_arg(args, "container_name")?;
                let cmd = vec![
                    self.container_runtime.clone(),
                    "stop".to_string(),
                    name,
                ];
                self.run_container_command(cmd, CONTAINER_TIMEOUT, "container_stop")
                    .await
            }
            other => {
                warn!(event = "tool_unknown", tool = other);
                Err(ToolFailure::Error(SentinelError::Tool(format!(
                    "unknown tool: {other}"
                ))))
            }
        }
    }

    /// Required arguments must be present; unknown extras are rejected.
    fn validate_args(
        &self,
        tool: &str,
        args: &BTreeMap<String, serde_json::Value>,
        required: &[&str],
        optional: &[&str],
    ) -> Result<(), ToolFailure> {
        for name in required {
            if !args.contains_key(*name) {
                return Err(ToolFailure::Error(SentinelError::Validation(format!(
                    "{tool}: missing required argument '{name}'"
                ))));
            }
        }
        for key in args.keys() {
            if !required.contains(&key.as_str()) && !optional.contains(&key.as_str()) {
                return Err(ToolFailure::Error(SentinelError::Validation(format!(
                    "{tool}: unknown argument '{key}'"
                ))));
            }
        }
        Ok(())
    }

    // ── File tools ──────────────────────────────────────────────

    async fn file_write(
        &self,
        args: &BTreeMap<String, serde_json::Value>,
        arg_data_ids: &[String],
    ) -> Result<TaggedData, ToolFailure> {
        let path = str_arg(args, "path")?;
        let content = str_arg(args, "content")?;

        match self.engine.check_path(&path, PathOperation::Write) {
            PolicyDecision::Blocked { rule_id, reason } => {
                warn!(event = "file_write_blocked", path = %path, rule = %rule_id);
                return Err(ToolFailure::blocked(rule_id, reason));
            }
            PolicyDecision::Allowed { .. } => {}
        }

        let canonical = self.engine.canonical_path(&path);
        let canonical_buf = PathBuf::from(&canonical);
        if let Some(parent) = canonical_buf.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SentinelError::Tool(format!("file_write failed: {e}")))?;
        }
        tokio::fs::write(&canonical, &content)
            .await
            .map_err(|e| SentinelError::Tool(format!("file_write failed: {e}")))?;

        info!(event = "file_written", path = %canonical, size = content.len());

        // The write result derives from the content's provenance, so the
        // recorded writer carries the content's trust through the union
        // rule.
        let tagged = self
            .provenance
            .create_tagged_data(
                &format!("File written: {canonical}"),
                DataSource::Tool,
                TrustLevel::Trusted,
                &format!("file_write:{canonical}"),
                arg_data_ids,
            )
            .await?;
        self.provenance.record_file_write(&canonical, &tagged.id).await?;
        Ok(tagged)
    }

    async fn file_read(
        &self,
        args: &BTreeMap<String, serde_json::Value>,
    ) -> Result<TaggedData, ToolFailure> {
        let path = str_arg(args, "path")?;

        match self.engine.check_path(&path, PathOperation::Read) {
            PolicyDecision::Blocked { rule_id, reason } => {
                warn!(event = "file_read_blocked", path = %path, rule = %rule_id);
                return Err(ToolFailure::blocked(rule_id, reason));
            }
            PolicyDecision::Allowed { .. } => {}
        }

        let canonical = self.engine.canonical_path(&path);
        let content = tokio::fs::read_to_string(&canonical)
            .await
            .map_err(|e| SentinelError::Tool(format!("file_read failed: {e}")))?;

        // Inherit the writer's trust through the provenance chain.
        // Untracked files (pre-existing workspace content) default to
        // trusted.
        let writer = self.provenance.get_file_writer(&canonical).await?;
        let parents: Vec<String> = writer.clone().into_iter().collect();

        info!(
            event = "file_read_success",
            path = %canonical,
            size = content.len(),
            inherited_from = ?writer,
        );

        Ok(self
            .provenance
            .create_tagged_data(
                &content,
                DataSource::File,
                TrustLevel::Trusted,
                &format!("file_read:{canonical}"),
                &parents,
            )
            .await?)
    }

    async fn mkdir(
        &self,
        args: &BTreeMap<String, serde_json::Value>,
    ) -> Result<TaggedData, ToolFailure> {
        let path = str_arg(args, "path")?;

        match self.engine.check_path(&path, PathOperation::Create) {
            PolicyDecision::Blocked { rule_id, reason } => {
                warn!(event = "mkdir_blocked", path = %path, rule = %rule_id);
                return Err(ToolFailure::blocked(rule_id, reason));
            }
            PolicyDecision::Allowed { .. } => {}
        }

        let canonical = self.engine.canonical_path(&path);
        tokio::fs::create_dir_all(&canonical)
            .await
            .map_err(|e| SentinelError::Tool(format!("mkdir failed: {e}")))?;

        info!(event = "mkdir_success", path = %canonical);
        Ok(self
            .provenance
            .create_tagged_data(
                &format!("Directory created: {canonical}"),
                DataSource::Tool,
                TrustLevel::Trusted,
                &format!("mkdir:{canonical}"),
                &[],
            )
            .await?)
    }

    async fn workspace_clean(&self) -> Result<TaggedData, ToolFailure> {
        let root = self.workspace_root.to_string_lossy().into_owned();
        match self.engine.check_path(&root, PathOperation::Write) {
            PolicyDecision::Blocked { rule_id, reason } => {
                return Err(ToolFailure::blocked(rule_id, reason));
            }
            PolicyDecision::Allowed { .. } => {}
        }

        let mut removed = 0usize;
        let mut entries = tokio::fs::read_dir(&self.workspace_root)
            .await
            .map_err(|e| SentinelError::Tool(format!("workspace_clean failed: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SentinelError::Tool(format!("workspace_clean failed: {e}")))?
        {
            let path = entry.path();
            let result = if path.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            result.map_err(|e| SentinelError::Tool(format!("workspace_clean failed: {e}")))?;
            removed += 1;
        }

        info!(event = "workspace_cleaned", removed);
        Ok(self
            .provenance
            .create_tagged_data(
                &format!("Workspace cleaned: {removed} entries removed"),
                DataSource::Tool,
                TrustLevel::Trusted,
                "workspace_clean",
                &[],
            )
            .await?)
    }

    // ── Shell & containers ──────────────────────────────────────

    async fn shell(
        &self,
        args: &BTreeMap<String, serde_json::Value>,
    ) -> Result<TaggedData, ToolFailure> {
        let command = str_arg(args, "command")?;

        match self.engine.check_command(&command) {
            PolicyDecision::Blocked { rule_id, reason } => {
                warn!(event = "shell_blocked", command = %command, rule = %rule_id);
                return Err(ToolFailure::blocked(rule_id, reason));
            }
            PolicyDecision::Allowed { .. } => {}
        }

        let tokens = shell_tokens(&command).ok_or_else(|| {
            SentinelError::Tool("command failed to tokenize after policy check".to_string())
        })?;

        // Filesystem trust gate: executing a file the worker wrote is the
        // canonical laundering attack, so any path argument with an
        // untrusted recorded writer blocks the command.
        self.check_path_args_trust(&tokens[1..]).await?;

        debug!(event = "shell_allowed", command = %command);
        let output = self
            .run_process(&tokens, SHELL_TIMEOUT)
            .await
            .map_err(|e| SentinelError::Tool(format!("shell failed: {e}")))?;

        Ok(self
            .provenance
            .create_tagged_data(
                &output,
                DataSource::Tool,
                TrustLevel::Trusted,
                &format!("shell:{command}"),
                &[],
            )
            .await?)
    }

    /// Block execution when any path-shaped argument was last written by
    /// untrusted provenance.
    async fn check_path_args_trust(&self, args: &[String]) -> Result<(), ToolFailure> {
        for arg in args {
            if arg.starts_with('-') || !arg.contains('/') {
                continue;
            }
            let canonical = self.engine.canonical_path(arg);
            if let Some(writer_id) = self.provenance.get_file_writer(&canonical).await? {
                let safe = self
                    .provenance
                    .is_trust_safe_for_execution(std::slice::from_ref(&writer_id))
                    .await?;
                if !safe {
                    warn!(
                        event = "trust_gate_blocked",
                        path = %canonical,
                        writer_id = %writer_id,
                    );
                    return Err(ToolFailure::blocked(
                        "provenance_trust_gate",
                        format!(
                            "{canonical} was written by untrusted provenance ({writer_id})"
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn run_container_command(
        &self,
        cmd: Vec<String>,
        timeout: Duration,
        tool: &str,
    ) -> Result<TaggedData, ToolFailure> {
        self.check_container_flags(&cmd)?;

        let joined = cmd.join(" ");
        match self.engine.check_command(&joined) {
            PolicyDecision::Blocked { rule_id, reason } => {
                warn!(event = "container_blocked", tool, rule = %rule_id);
                return Err(ToolFailure::blocked(rule_id, reason));
            }
            PolicyDecision::Allowed { .. } => {}
        }

        self.check_path_args_trust(&cmd[1..]).await?;

        info!(event = "container_command_allowed", tool, command = %joined);
        let output = self
            .run_process(&cmd, timeout)
            .await
            .map_err(|e| SentinelError::Tool(format!("{tool} failed: {e}")))?;

        Ok(self
            .provenance
            .create_tagged_data(
                &output,
                DataSource::Tool,
                TrustLevel::Trusted,
                &format!("{tool}:{joined}"),
                &[],
            )
            .await?)
    }

    /// Reject dangerous container flags before the policy check.
    fn check_container_flags(&self, cmd: &[String]) -> Result<(), ToolFailure> {
        for arg in cmd {
            let flag_name = arg.split_once('=').map(|(name, _)| name).unwrap_or(arg);
            if DANGEROUS_CONTAINER_FLAG_NAMES.contains(&flag_name) {
                warn!(event = "container_flag_blocked", flag = %arg);
                return Err(ToolFailure::blocked(
                    "policy:container_flag",
                    format!("dangerous container flag blocked: {arg}"),
                ));
            }
            if DANGEROUS_CONTAINER_FLAG_VALUES.contains(&arg.as_str()) {
                warn!(event = "container_flag_blocked", flag = %arg);
                return Err(ToolFailure::blocked(
                    "policy:container_flag",
                    format!("dangerous container flag blocked: {arg}"),
                ));
            }
        }
        Ok(())
    }

    /// Run an argv with a timeout, no shell interpretation. Non-zero exits
    /// append the code and stderr to the output, matching operator
    /// expectations for build-style tools.
    async fn run_process(&self, argv: &[String], timeout: Duration) -> Result<String, String> {
        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&self.workspace_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| format!("timed out after {}s", timeout.as_secs()))?
            .map_err(|e| e.to_string())?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            warn!(event = "process_nonzero_exit", code);
            text.push_str(&format!(
                "\n[exit code: {code}]\n{}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        Ok(text)
    }
}

fn str_arg(
    args: &BTreeMap<String, serde_json::Value>,
    name: &str,
) -> Result<String, ToolFailure> {
    match args.get(name) {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(ToolFailure::Error(SentinelError::Validation(format!(
            "argument '{name}' must be a string, got {other}"
        )))),
        None => Err(ToolFailure::Error(SentinelError::Validation(format!(
            "missing required argument '{name}'"
        )))),
    }
}

// ============================================================
// Tests
// ============================================================
