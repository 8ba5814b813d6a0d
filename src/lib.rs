//! End-to-end test harness for CLI plugin commands.
//!
//! Provides infrastructure for driving plugin commands against fixture
//! projects including:
//! - Command resolution with test-scoped override registries
//! - A sequenced setup/execute/verify/finalize pipeline per command run
//! - Container and network leak detection after every run
//! - Assertion helpers for exit codes and captured output
//!
//! The entry point is [`test_command`], which returns a [`ChainBuilder`].
//! Configuration recorded on the builder is consumed only when the chain
//! runs, never at registration time:
//!
//! ```ignore
//! let outcome = test_command("projects/simple-worker", "worker:deploy", ["--json"])
//!     .custom_commands(CommandRegistry::new().register("deploy", Arc::new(DeployStub)))
//!     .prepare(|ctx| Box::pin(async move {
//!         ctx.write_stdout("seeding credentials");
//!         Ok(())
//!     }))
//!     .run()
//!     .await?;
//! assert_exit_code(&outcome, 0)?;
//! ```

pub mod assertions;
pub mod dispatch;
pub mod harness;
pub mod leaks;

pub use assertions::{assert_exit_code, assert_missing_or_empty_directory, assert_occurrences};
pub use dispatch::{Command, CommandRegistry, CommandResolver, ResolvedCommand, execute_command};
pub use harness::{
    ChainBuilder, ChainConfig, HarnessError, HarnessResult, RunContext, RunOutcome, TestChain,
    test_command,
};
pub use leaks::{
    ContainerRuntime, ContainerSummary, DockerCli, MOCK_SERVER_CONTAINER_PREFIX,
    MOCK_SERVER_NETWORK_PREFIX, NetworkSummary, WORKER_RUNNER_CONTAINER_PREFIX,
    assert_no_leaked_resources,
};
