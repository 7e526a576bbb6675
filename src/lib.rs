//! Isolate server - remote code execution in Linux sandboxes.
//!
//! Two modes are exposed over HTTP:
//! - **ephemeral**: `POST /execute` opens a sandbox, runs the code and tears
//!   the sandbox down again.
//! - **sessions**: `POST /sessions` opens a sandbox that stays alive across
//!   `POST /sessions/:id/execute` calls until `DELETE /sessions/:id`.
//!
//! The sandbox itself sits behind [`ExecutionEnvironment`]; the session
//! layer only relies on its `open`/`run`/`close` contract.

pub mod config;
pub mod environment;
pub mod ephemeral;
pub mod error;
pub mod http_server;
pub mod id;
pub mod registry;
#[cfg(target_os = "linux")]
pub mod sandbox;
pub mod session;
pub mod state;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{SandboxLimits, ServerConfig};
pub use environment::{
    EnvironmentError, EnvironmentFactory, ExecutionEnvironment, ExecutionOutput, Language,
};
pub use ephemeral::EphemeralExecutor;
pub use error::{FaultKind, ServiceError, ServiceResult};
pub use id::{IdGenerator, SessionId, UuidGenerator};
pub use session::{SessionInfo, SessionManager};
pub use state::AppState;
