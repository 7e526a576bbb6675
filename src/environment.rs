//! The execution environment capability and the types that flow through it.
//!
//! An environment is a stateful, single-occupant runtime for one language.
//! Callers must `open` it exactly once, may `run` code in it any number of
//! times (never concurrently), and `close` it when done. All three methods
//! block; async code drives them through `tokio::task::spawn_blocking`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Languages an environment can be prepared for.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    #[serde(alias = "js", alias = "node")]
    #[value(name = "javascript", alias = "js", alias = "node")]
    JavaScript,
    Ruby,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Ruby => "ruby",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured result of running code. A nonzero exit code is a normal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Failure of the environment itself, as opposed to failure of user code.
#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("environment is already open")]
    AlreadyOpen,

    #[error("environment is not open")]
    NotOpen,

    #[error("sandbox: {0}")]
    Sandbox(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Isolated runtime for one language.
pub trait ExecutionEnvironment: Send {
    /// Allocate and prepare the runtime.
    fn open(&mut self) -> Result<(), EnvironmentError>;

    /// Run `code` after installing `libraries`.
    fn run(
        &mut self,
        code: &str,
        libraries: &[String],
    ) -> Result<ExecutionOutput, EnvironmentError>;

    /// Tear the runtime down. Closing an environment that is not open is a no-op.
    fn close(&mut self) -> Result<(), EnvironmentError>;
}

/// Builds unopened environments. Shared by every request.
pub trait EnvironmentFactory: Send + Sync {
    fn create(&self, language: Language, keep_template: bool) -> Box<dyn ExecutionEnvironment>;
}
