pub mod entity;
pub mod error;
pub mod optimizer;
pub mod store;
