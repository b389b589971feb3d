pub mod config;
pub mod engine;
pub mod listener;
pub mod queue;
pub mod stats;
pub mod worker;

pub use config::Config;
pub use engine::{Ems, EmsError, SeatGrid};
pub use queue::SessionQueue;
pub use stats::Stats;
