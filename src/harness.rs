//! Test chain pipeline for driving one plugin command end to end.
//!
//! A chain runs one command against one fixture project: it cleans stale
//! build output, installs project dependencies if needed, runs an optional
//! prepare hook, executes the command through a resolver, verifies that no
//! container-runtime resources were leaked, and always finishes with a
//! finalizer that snapshots captured output and clears the exit-code slot.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::dispatch::{CommandRegistry, execute_command};
use crate::leaks::{ContainerRuntime, DockerCli, assert_no_leaked_resources};

/// Error type for harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Setup failed: {0}")]
    SetupFailed(String),

    #[error("{0}")]
    ResourceLeak(String),

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Chain timed out after {0:?}")]
    Timeout(Duration),

    #[error("Container runtime query failed: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Configuration for one test chain
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Directory that fixture project paths are resolved against
    pub base_dir: PathBuf,
    /// Build-output directories removed before each run
    pub build_dirs: Vec<String>,
    /// Directory whose presence means dependencies are already installed
    pub install_marker: String,
    /// Command run to install project dependencies
    pub install_command: Vec<String>,
    /// Wall-clock bound over install, prepare, execution, and leak check
    pub timeout: Duration,
    /// Namespace prefix stripped from command identifiers
    pub namespace_prefix: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            build_dirs: vec!["dist".to_string(), "build".to_string()],
            install_marker: "node_modules".to_string(),
            install_command: vec!["npm".to_string(), "install".to_string()],
            // npm install can take some time
            timeout: Duration::from_secs(30),
            namespace_prefix: "worker:".to_string(),
        }
    }
}

#[derive(Default)]
struct Captured {
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    error: Option<anyhow::Error>,
}

/// Execution context for one pipeline run.
///
/// Carries the resolved fixture directory, output capture buffers, an error
/// slot, and an exit-code slot. Clones share the same buffers, so the chain
/// can snapshot output in its finalizer even when the pipeline future was
/// cancelled by the timeout.
#[derive(Clone)]
pub struct RunContext {
    project_dir: PathBuf,
    captured: Arc<Mutex<Captured>>,
}

impl RunContext {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            captured: Arc::new(Mutex::new(Captured::default())),
        }
    }

    /// The fixture project directory this run operates on
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Append a line to the captured stdout buffer
    pub fn write_stdout(&self, text: impl AsRef<str>) {
        Self::append(&mut self.captured.lock().unwrap().stdout, text.as_ref());
    }

    /// Append a line to the captured stderr buffer
    pub fn write_stderr(&self, text: impl AsRef<str>) {
        Self::append(&mut self.captured.lock().unwrap().stderr, text.as_ref());
    }

    pub fn stdout(&self) -> String {
        self.captured.lock().unwrap().stdout.clone()
    }

    pub fn stderr(&self) -> String {
        self.captured.lock().unwrap().stderr.clone()
    }

    /// Record the command's exit code
    pub fn set_exit_code(&self, code: i32) {
        self.captured.lock().unwrap().exit_code = Some(code);
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.captured.lock().unwrap().exit_code
    }

    /// Record a command failure without aborting the pipeline
    pub fn record_error(&self, error: anyhow::Error) {
        self.captured.lock().unwrap().error = Some(error);
    }

    pub fn has_error(&self) -> bool {
        self.captured.lock().unwrap().error.is_some()
    }

    fn append(buffer: &mut String, text: &str) {
        buffer.push_str(text);
        if !text.ends_with('\n') {
            buffer.push('\n');
        }
    }

    /// Move captured state into an outcome snapshot, leaving all slots empty
    /// so nothing can bleed into a later chain.
    fn take_outcome(&self) -> RunOutcome {
        let mut captured = self.captured.lock().unwrap();
        RunOutcome {
            exit_code: captured.exit_code.take(),
            stdout: std::mem::take(&mut captured.stdout),
            stderr: std::mem::take(&mut captured.stderr),
            error: captured.error.take(),
        }
    }
}

/// Snapshot of one completed chain run
#[derive(Debug)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<anyhow::Error>,
}

impl RunOutcome {
    /// Check if the command succeeded (no error, exit code unset or 0)
    pub fn success(&self) -> bool {
        self.error.is_none() && matches!(self.exit_code, None | Some(0))
    }

    /// Check if stdout contains a pattern
    pub fn stdout_contains(&self, pattern: &str) -> bool {
        self.stdout.contains(pattern)
    }

    /// Check if stderr contains a pattern
    pub fn stderr_contains(&self, pattern: &str) -> bool {
        self.stderr.contains(pattern)
    }
}

/// Future returned by a prepare hook
pub type PrepareFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

type PrepareFn = Box<dyn FnOnce(RunContext) -> PrepareFuture + Send>;

/// Start building a test chain for one command invocation.
///
/// `dir` is the fixture project directory, relative to the configured base
/// directory. Builder mutators only record values; nothing takes effect until
/// the chain runs.
pub fn test_command(
    dir: impl Into<PathBuf>,
    command: impl Into<String>,
    args: impl IntoIterator<Item = impl Into<String>>,
) -> ChainBuilder {
    ChainBuilder {
        config: ChainConfig::default(),
        dir: dir.into(),
        command: command.into(),
        args: args.into_iter().map(Into::into).collect(),
        prepare: None,
        registry: None,
        runtime: None,
    }
}

/// Builder for a [`TestChain`]. All slots may be set any number of times
/// before [`build`](Self::build); last write wins.
pub struct ChainBuilder {
    config: ChainConfig,
    dir: PathBuf,
    command: String,
    args: Vec<String>,
    prepare: Option<PrepareFn>,
    registry: Option<CommandRegistry>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
}

impl ChainBuilder {
    /// Replace the chain configuration
    pub fn config(mut self, config: ChainConfig) -> Self {
        self.config = config;
        self
    }

    /// Record a prepare hook, invoked with the run context after setup and
    /// before command execution
    pub fn prepare<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(RunContext) -> PrepareFuture + Send + 'static,
    {
        self.prepare = Some(Box::new(hook));
        self
    }

    /// Record the command registry used to resolve the command under test
    pub fn custom_commands(mut self, registry: CommandRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the container runtime queried by the leak detector
    pub fn container_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Finalize the recorded configuration into an immutable chain
    pub fn build(self) -> TestChain {
        let command = self
            .command
            .strip_prefix(&self.config.namespace_prefix)
            .unwrap_or(&self.command)
            .to_string();

        TestChain {
            config: self.config,
            dir: self.dir,
            command,
            args: self.args,
            prepare: self.prepare,
            registry: self.registry.unwrap_or_default(),
            runtime: self
                .runtime
                .unwrap_or_else(|| Arc::new(DockerCli::default())),
        }
    }

    /// Finalize and run the chain
    pub async fn run(self) -> HarnessResult<RunOutcome> {
        self.build().run().await
    }
}

/// One finalized end-to-end command test
pub struct TestChain {
    config: ChainConfig,
    dir: PathBuf,
    command: String,
    args: Vec<String>,
    prepare: Option<PrepareFn>,
    registry: CommandRegistry,
    runtime: Arc<dyn ContainerRuntime>,
}

impl TestChain {
    /// Run the pipeline: setup, prepare hook, command execution, leak check,
    /// finalizer.
    ///
    /// A failing command does not abort the chain; its error is recorded in
    /// the returned outcome so the leak check and finalizer still run. Setup
    /// failures, leaked resources, and the wall-clock timeout are returned as
    /// hard errors.
    pub async fn run(self) -> HarnessResult<RunOutcome> {
        let Self {
            config,
            dir,
            command,
            args,
            prepare,
            registry,
            runtime,
        } = self;

        let project_dir = config.base_dir.join(&dir);
        if !project_dir.is_dir() {
            return Err(HarnessError::SetupFailed(format!(
                "fixture project directory not found: {}",
                project_dir.display()
            )));
        }
        debug!(dir = %project_dir.display(), command = %command, "starting test chain");

        clean_build_dirs(&project_dir, &config.build_dirs)?;

        let ctx = RunContext::new(&project_dir);
        let finalizer_handle = ctx.clone();

        let pipeline = async {
            install_dependencies(&project_dir, &config).await?;

            if let Some(prepare) = prepare {
                debug!("running prepare hook");
                prepare(ctx.clone()).await.map_err(|err| {
                    HarnessError::SetupFailed(format!("prepare hook failed: {err:#}"))
                })?;
            }

            debug!(command = %command, args = ?args, "executing command under test");
            if let Err(error) = execute_command(&registry, ctx.clone(), &command, &args).await {
                ctx.record_error(error);
            }

            assert_no_leaked_resources(runtime.as_ref())?;
            Ok::<(), HarnessError>(())
        };

        let result = tokio::time::timeout(config.timeout, pipeline).await;

        // Finalizer: always runs. Snapshotting clears the context's exit-code
        // and error slots; captured output is replayed only for failed runs.
        let outcome = finalizer_handle.take_outcome();
        let failed = outcome.error.is_some() || !matches!(result, Ok(Ok(())));
        if failed {
            if !outcome.stdout.is_empty() {
                eprintln!("{}", outcome.stdout);
            }
            if !outcome.stderr.is_empty() {
                eprintln!("{}", outcome.stderr);
            }
        }

        match result {
            Ok(Ok(())) => Ok(outcome),
            Ok(Err(error)) => Err(error),
            Err(_elapsed) => Err(HarnessError::Timeout(config.timeout)),
        }
    }
}

/// Remove stale build-output directories. Absence is not an error.
fn clean_build_dirs(project_dir: &Path, build_dirs: &[String]) -> HarnessResult<()> {
    for name in build_dirs {
        let path = project_dir.join(name);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale build directory"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(HarnessError::SetupFailed(format!(
                    "failed to remove {}: {err}",
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

/// Run the project's install command unless the marker directory exists.
async fn install_dependencies(project_dir: &Path, config: &ChainConfig) -> HarnessResult<()> {
    if project_dir.join(&config.install_marker).exists() {
        debug!(marker = %config.install_marker, "dependencies already installed");
        return Ok(());
    }

    let (program, args) = config
        .install_command
        .split_first()
        .ok_or_else(|| HarnessError::SetupFailed("install command is empty".to_string()))?;

    info!(
        command = %config.install_command.join(" "),
        dir = %project_dir.display(),
        "installing project dependencies"
    );

    let output = tokio::process::Command::new(program)
        .args(args)
        .current_dir(project_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| {
            HarnessError::SetupFailed(format!("failed to run install command {program}: {err}"))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(HarnessError::SetupFailed(format!(
            "install command failed with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_appends_lines_to_capture_buffers() {
        let ctx = RunContext::new("/tmp/project");
        ctx.write_stdout("first");
        ctx.write_stdout("second\n");
        ctx.write_stderr("warning");

        assert_eq!(ctx.stdout(), "first\nsecond\n");
        assert_eq!(ctx.stderr(), "warning\n");
    }

    #[test]
    fn context_clones_share_buffers() {
        let ctx = RunContext::new("/tmp/project");
        let clone = ctx.clone();
        clone.write_stdout("from clone");
        clone.set_exit_code(3);

        assert_eq!(ctx.stdout(), "from clone\n");
        assert_eq!(ctx.exit_code(), Some(3));
    }

    #[test]
    fn take_outcome_clears_exit_code_and_error_slots() {
        let ctx = RunContext::new("/tmp/project");
        ctx.write_stdout("output");
        ctx.set_exit_code(1);
        ctx.record_error(anyhow::anyhow!("boom"));

        let outcome = ctx.take_outcome();
        assert_eq!(outcome.exit_code, Some(1));
        assert_eq!(outcome.stdout, "output\n");
        assert!(outcome.error.is_some());
        assert!(!outcome.success());

        // the context reads as unset for the next chain
        assert_eq!(ctx.exit_code(), None);
        assert!(!ctx.has_error());
        assert_eq!(ctx.stdout(), "");
    }

    #[test]
    fn outcome_success_requires_clean_exit() {
        let clean = RunOutcome {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
        };
        assert!(clean.success());

        let failed = RunOutcome {
            exit_code: Some(1),
            ..clean
        };
        assert!(!failed.success());
    }

    #[test]
    fn builder_strips_namespace_prefix() {
        let chain = test_command("projects/app", "worker:deploy", ["--json"]).build();
        assert_eq!(chain.command, "deploy");
        assert_eq!(chain.args, vec!["--json".to_string()]);
    }

    #[test]
    fn builder_leaves_other_commands_untouched() {
        let chain = test_command("projects/app", "app:deploy", Vec::<String>::new()).build();
        assert_eq!(chain.command, "app:deploy");
    }

    #[test]
    fn config_defaults_match_fixture_project_layout() {
        let config = ChainConfig::default();
        assert_eq!(config.build_dirs, vec!["dist", "build"]);
        assert_eq!(config.install_marker, "node_modules");
        assert_eq!(config.install_command, vec!["npm", "install"]);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn clean_build_dirs_ignores_missing_directories() {
        let tmp = tempfile::tempdir().unwrap();
        clean_build_dirs(tmp.path(), &["dist".to_string(), "build".to_string()]).unwrap();

        std::fs::create_dir_all(tmp.path().join("dist/inner")).unwrap();
        std::fs::write(tmp.path().join("dist/inner/action.zip"), b"zip").unwrap();
        clean_build_dirs(tmp.path(), &["dist".to_string()]).unwrap();
        assert!(!tmp.path().join("dist").exists());
    }
}
