pub mod span;
pub mod trace;
