pub mod actor;
pub mod audit;
pub mod cycle;
