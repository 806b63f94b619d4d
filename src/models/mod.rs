pub mod job;
pub mod submission;
