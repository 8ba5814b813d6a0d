//! Container and network leak detection.
//!
//! Every command under test is expected to create and fully tear down its own
//! transient containers and networks, even when it fails. A survivor after a
//! run indicates a cleanup defect in the command, so the detector fails hard
//! and names the exact remediation command; leaked resources are invisible
//! side effects that corrupt subsequent test runs.
//!
//! Test infrastructure is required to use the reserved naming prefixes below,
//! which is what makes detection a simple prefix match against a fresh
//! snapshot of the runtime's state.

use serde::Deserialize;
use std::process::Command;

use tracing::debug;

use crate::harness::{HarnessError, HarnessResult};

/// Name prefix for containers started by the mock HTTP server
pub const MOCK_SERVER_CONTAINER_PREFIX: &str = "e2e-mock-server-";

/// Name prefix for networks created by the mock HTTP server
pub const MOCK_SERVER_NETWORK_PREFIX: &str = "e2e-mock-net-";

/// Name prefix for containers started by the worker test runner
pub const WORKER_RUNNER_CONTAINER_PREFIX: &str = "e2e-worker-";

/// One container as reported by the runtime. A container can carry several
/// names; each may begin with a `/` separator.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub names: Vec<String>,
    pub state: String,
}

/// One network as reported by the runtime
#[derive(Debug, Clone)]
pub struct NetworkSummary {
    pub name: String,
}

/// Read-only view of a container runtime's live state.
///
/// Queries are blocking calls to a local daemon; a query failure is a hard
/// test failure, never retried.
pub trait ContainerRuntime: Send + Sync {
    fn list_containers(&self, include_stopped: bool) -> HarnessResult<Vec<ContainerSummary>>;
    fn list_networks(&self) -> HarnessResult<Vec<NetworkSummary>>;
}

/// Docker engine queried through the `docker` CLI with JSON-line output
pub struct DockerCli {
    program: String,
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn query(&self, args: &[&str]) -> HarnessResult<String> {
        debug!(program = %self.program, args = ?args, "querying container runtime");
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|err| {
                HarnessError::Runtime(format!("failed to invoke {}: {err}", self.program))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HarnessError::Runtime(format!(
                "{} {} failed with {}: {}",
                self.program,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn parse_lines<T: for<'de> Deserialize<'de>>(&self, raw: &str) -> HarnessResult<Vec<T>> {
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|err| {
                    HarnessError::Runtime(format!("unparseable {} output: {err}", self.program))
                })
            })
            .collect()
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[derive(Deserialize)]
struct PsRow {
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State")]
    state: String,
}

#[derive(Deserialize)]
struct NetworkRow {
    #[serde(rename = "Name")]
    name: String,
}

impl ContainerRuntime for DockerCli {
    fn list_containers(&self, include_stopped: bool) -> HarnessResult<Vec<ContainerSummary>> {
        let mut args = vec!["ps"];
        if include_stopped {
            args.push("--all");
        }
        args.extend(["--format", "{{json .}}"]);

        let raw = self.query(&args)?;
        let rows: Vec<PsRow> = self.parse_lines(&raw)?;
        Ok(rows
            .into_iter()
            .map(|row| ContainerSummary {
                names: row
                    .names
                    .split(',')
                    .map(|name| name.trim().to_string())
                    .collect(),
                state: row.state,
            })
            .collect())
    }

    fn list_networks(&self) -> HarnessResult<Vec<NetworkSummary>> {
        let raw = self.query(&["network", "ls", "--format", "{{json .}}"])?;
        let rows: Vec<NetworkRow> = self.parse_lines(&raw)?;
        Ok(rows
            .into_iter()
            .map(|row| NetworkSummary { name: row.name })
            .collect())
    }
}

/// Assert the runtime holds no containers or networks created by test
/// infrastructure.
///
/// Containers are listed including stopped ones, and each reported name has
/// its leading `/` separator stripped before the prefix comparison. The first
/// match fails the chain with the resource's name, its state, and the exact
/// command to remove it manually.
pub fn assert_no_leaked_resources(runtime: &dyn ContainerRuntime) -> HarnessResult<()> {
    for container in runtime.list_containers(true)? {
        for raw_name in &container.names {
            let name = raw_name.strip_prefix('/').unwrap_or(raw_name);
            if name.starts_with(WORKER_RUNNER_CONTAINER_PREFIX)
                || name.starts_with(MOCK_SERVER_CONTAINER_PREFIX)
            {
                return Err(HarnessError::ResourceLeak(format!(
                    "Docker container left behind ({}): {name} \
                     If unsure, remove using 'docker rm -f {name}' and run tests again",
                    container.state
                )));
            }
        }
    }

    for network in runtime.list_networks()? {
        if network.name.starts_with(MOCK_SERVER_NETWORK_PREFIX) {
            return Err(HarnessError::ResourceLeak(format!(
                "Docker network left behind: {} \
                 If unsure, remove using 'docker network rm {}' and run tests again",
                network.name, network.name
            )));
        }
    }

    Ok(())
}
