//! Core types shared across uprez.

pub mod error;

pub use error::{CONFIG_FAILURE_EXIT_CODE, ErrorContext, UprezError, user_friendly_error};
