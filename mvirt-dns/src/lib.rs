pub mod adapter;
pub mod catalog;
pub mod config;
pub mod core;
pub mod error;
pub mod frame;
pub mod generation;
pub mod handler;
pub mod quiescence;
pub mod raw;
pub mod socket;
pub mod test_util;
pub mod worker;
pub mod zonefile;

pub use crate::core::Core;
pub use error::{CoreError, Result};
