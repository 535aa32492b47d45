//! Common utilities and types shared across minicoord

pub mod config;
pub mod error;
pub mod utils;

pub use config::{ClusterConfig, Config};
pub use error::{Error, Result};
pub use utils::{
    join_addrs, parse_duration, split_addrs, timestamp_now_millis, Clock, ManualClock, SystemClock,
};
