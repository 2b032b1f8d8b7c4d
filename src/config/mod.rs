//! Configuration helpers shared by the CLI.

mod duration;

pub use duration::parse_duration;
