pub mod job;
pub mod protocol;
