//! Command resolution with test-scoped overrides.
//!
//! Tests are not running inside a full plugin host, so commands are resolved
//! through an explicit [`CommandRegistry`] value owned by each chain instead
//! of the host's own lookup. The registry substitutes test doubles for
//! specific command identifiers, can force an identifier to be unresolvable,
//! and delegates everything else to an optional fallback resolver (the
//! production command table). Because every chain carries its own registry,
//! overrides can never bleed between tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::harness::RunContext;

/// A runnable command implementation.
///
/// Commands write their console output into the run context and may record an
/// exit code there; a returned error is captured by the chain rather than
/// aborting it.
#[async_trait]
pub trait Command: Send + Sync {
    async fn run(&self, ctx: RunContext, args: &[String]) -> anyhow::Result<()>;
}

/// Resolves command identifiers to runnable implementations
pub trait CommandResolver: Send + Sync {
    fn find_command(&self, id: &str) -> Option<ResolvedCommand>;
}

/// A command resolved under a specific identifier. Resolution tags the
/// command with the identifier it was looked up under, so an override behaves
/// as if it were registered there natively.
pub struct ResolvedCommand {
    pub id: String,
    pub command: Arc<dyn Command>,
}

enum OverrideEntry {
    Command(Arc<dyn Command>),
    NotFound,
}

/// Test-scoped command table.
///
/// Later registrations for the same identifier replace earlier ones.
#[derive(Default)]
pub struct CommandRegistry {
    overrides: HashMap<String, OverrideEntry>,
    fallback: Option<Arc<dyn CommandResolver>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry that delegates unmatched identifiers to `fallback`
    pub fn with_fallback(fallback: Arc<dyn CommandResolver>) -> Self {
        Self {
            overrides: HashMap::new(),
            fallback: Some(fallback),
        }
    }

    /// Register a command under an identifier
    pub fn register(mut self, id: impl Into<String>, command: Arc<dyn Command>) -> Self {
        self.overrides
            .insert(id.into(), OverrideEntry::Command(command));
        self
    }

    /// Force an identifier to resolve to nothing, simulating an unresolvable
    /// command even when the fallback knows it
    pub fn register_missing(mut self, id: impl Into<String>) -> Self {
        self.overrides.insert(id.into(), OverrideEntry::NotFound);
        self
    }
}

impl CommandResolver for CommandRegistry {
    fn find_command(&self, id: &str) -> Option<ResolvedCommand> {
        match self.overrides.get(id) {
            Some(OverrideEntry::Command(command)) => Some(ResolvedCommand {
                id: id.to_string(),
                command: Arc::clone(command),
            }),
            Some(OverrideEntry::NotFound) => None,
            None => self
                .fallback
                .as_ref()
                .and_then(|fallback| fallback.find_command(id)),
        }
    }
}

/// Execute one command invocation through a resolver.
///
/// An identifier the resolver cannot satisfy is an execution failure, not a
/// setup failure: the chain captures it and still runs its post-conditions.
pub async fn execute_command(
    resolver: &dyn CommandResolver,
    ctx: RunContext,
    id: &str,
    args: &[String],
) -> anyhow::Result<()> {
    let resolved = resolver
        .find_command(id)
        .ok_or_else(|| anyhow::anyhow!("command not found: {id}"))?;
    debug!(id = %resolved.id, "command resolved");
    resolved.command.run(ctx, args).await
}
