//! tickwork-executors: pluggable runners for the four job kinds.
//!
//! - `http`: outbound request through `reqwest`, 2xx is success
//! - `procedure`: named in-process function from a [`ProcedureRegistry`]
//! - `script`: `rhai` source evaluated on a pooled engine
//! - `shell`: child process via bash, sh, python or node
//!
//! Dispatch looks executors up by kind in an [`ExecutorRegistry`] and owns
//! retry and timeout; executors only turn one attempt into an [`Outcome`].

pub mod error;
pub mod http;
pub mod output;
pub mod procedure;
pub mod registry;
pub mod script;
pub mod shell;
pub mod types;

pub use error::{ExecutorError, Result};
pub use procedure::{FnProcedure, Procedure, ProcedureRegistry};
pub use registry::ExecutorRegistry;
pub use script::EnginePool;
pub use types::{Executor, JobContext, Outcome};
