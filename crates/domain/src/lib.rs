#![forbid(unsafe_code)]

pub mod chain;
pub mod common;
pub mod compiler;
pub mod horus;
pub mod pipeline;
