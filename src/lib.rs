pub mod alert;
pub mod bus;
pub mod confirmation;
pub mod config;
pub mod core;
pub mod engine;
pub mod persistence;
pub mod pipeline;
pub mod pressure;
pub mod scheduler;
pub mod scoring;
pub mod source;
