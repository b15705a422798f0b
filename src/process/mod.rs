//! Process Management
//!
//! - Named worker lifecycle (spawn, graceful stop, forced kill, exit events)
//! - Time-bounded external commands
//! - Liveness probes for arbitrary pids

pub mod child;
pub mod command;
pub mod liveness;

pub use child::{ChildDescriptor, ChildEvent, ChildExit, ChildProcessManager, ChildStatus};
pub use command::{CommandOutput, CommandRunner, CommandSpec, TokioCommandRunner};
pub use liveness::is_alive;
