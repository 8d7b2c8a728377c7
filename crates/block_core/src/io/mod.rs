pub mod catalog;
pub mod trace;
