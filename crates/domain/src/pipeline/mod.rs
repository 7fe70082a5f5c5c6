pub mod builder;
pub mod entity;
