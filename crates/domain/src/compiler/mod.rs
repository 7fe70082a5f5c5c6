pub mod bitvector;
pub mod field;
