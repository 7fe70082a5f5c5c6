pub mod substrate;
pub mod table;
