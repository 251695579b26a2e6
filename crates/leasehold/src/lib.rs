#![doc = include_str!("../README.md")]

mod broker;
mod config;
mod error;
mod message;
mod queue;
mod signal;
mod telemetry;

pub use crate::broker::*;
pub use crate::config::*;
pub use crate::error::*;
pub use crate::message::*;
pub use crate::queue::*;
pub use tokio_util::sync::CancellationToken;
