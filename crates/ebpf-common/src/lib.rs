#![cfg_attr(not(feature = "std"), no_std)]

pub mod horus;
pub mod pipeline;
