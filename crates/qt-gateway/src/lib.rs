//! Gateway abstraction: the surface a brokerage execution/market-data SDK
//! driver must implement, plus an in-process simulator for tests and
//! sandbox runs. Production SDK bindings live out of tree.

pub mod gateway;
pub mod sim;

pub use gateway::*;
pub use sim::*;
