use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration of one farm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FarmConfig {
    /// Method names the facade exposes, fixed at construction.
    #[serde(default)]
    pub exported_methods: Vec<String>,

    /// Exported methods whose functions return lazy sequences.
    #[serde(default)]
    pub sequence_methods: Vec<String>,

    /// Pool size. Defaults to available parallelism minus one.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Total start attempts per call, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub scheduling: Scheduling,

    /// Grace period for `end()` before workers are force-terminated.
    #[serde(default = "default_force_exit_timeout_ms")]
    pub force_exit_timeout_ms: u64,

    /// When false, worker output is also mirrored to the host's streams.
    #[serde(default = "default_silent")]
    pub silent: bool,

    /// Passed to the module's setup on every (re)initialization.
    #[serde(default)]
    pub setup_args: Vec<Value>,

    #[serde(default)]
    pub fork_options: ForkOptions,
}

pub(crate) fn default_num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

fn default_max_retries() -> u32 {
    3
}

fn default_force_exit_timeout_ms() -> u64 {
    500
}

fn default_silent() -> bool {
    true
}

// ── Section configs ─────────────────────────────────────────────────

/// How worker processes are launched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkOptions {
    /// Executable to run. Defaults to the module path.
    pub program: Option<PathBuf>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment for the child only.
    #[serde(default)]
    pub env: HashMap<String, String>,

    pub cwd: Option<PathBuf>,

    /// Parent directory for per-worker sockets. Defaults to the temp dir.
    pub socket_dir: Option<PathBuf>,
}

/// Execution unit backing each worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Process,
    Thread,
    /// Single module in the caller's context. No isolation, no protocol.
    InProcess,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" => Ok(Self::Process),
            "thread" => Ok(Self::Thread),
            "in-process" => Ok(Self::InProcess),
            other => Err(format!(
                "invalid backend '{other}', expected 'process', 'thread' or 'in-process'"
            )),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Process => "process",
            Self::Thread => "thread",
            Self::InProcess => "in-process",
        })
    }
}

/// Which idle worker receives the next call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scheduling {
    /// Least recently used idle worker.
    #[default]
    RoundRobin,
    /// Lowest-id idle worker.
    InOrder,
}

impl FromStr for Scheduling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(Self::RoundRobin),
            "in-order" => Ok(Self::InOrder),
            other => Err(format!(
                "invalid scheduling '{other}', expected 'round-robin' or 'in-order'"
            )),
        }
    }
}

impl fmt::Display for Scheduling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RoundRobin => "round-robin",
            Self::InOrder => "in-order",
        })
    }
}
