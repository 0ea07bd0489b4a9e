//! wsim library
//!
//! Workload descriptor compiler and concurrent submission scheduler for
//! synthetic accelerator workloads.

pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod parser;
pub mod scheduler;
pub mod timing;
pub mod workload;

pub use error::{Result, WsimError};
