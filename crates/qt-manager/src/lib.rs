//! The Manager process: one TraderProxy per account fronting its Trader
//! subprocess over IPC, a supervisor that spawns/restarts the subprocesses,
//! and an event engine fanning account-tagged pushes out to API consumers.

pub mod proxy;
pub mod supervisor;
pub mod manager;

pub use manager::Manager;
pub use proxy::{TraderProxy, TraderState};
pub use supervisor::RestartPolicy;
