//! Application services.

pub mod compile;
pub mod error;
