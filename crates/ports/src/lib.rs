#![forbid(unsafe_code)]

//! Boundary traits between the filter service and the outside world.
//!
//! `primary` is what drivers call (the agent, tests); `secondary` is what
//! the service needs from a program substrate and the host.

pub mod primary;
pub mod secondary;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
