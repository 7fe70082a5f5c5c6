pub mod compiler;
pub mod entity;
