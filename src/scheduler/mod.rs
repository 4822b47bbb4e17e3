pub mod budget;
pub mod scheduler;
