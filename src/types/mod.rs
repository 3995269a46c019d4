pub mod job;
pub mod payload;
pub mod states;
