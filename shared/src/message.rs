//! Fixed-layout records exchanged over the control connection.

pub mod request;
pub mod stat;
pub mod version;

pub use request::{Request, REQUEST_SIZE, STRING_SIZE};
pub use stat::{Direction, NodeStat, Tick, Ticks, Transfer, STAT_SIZE, T_N};
pub use version::{Version, VERSION, VERSION_SIZE};
