pub mod config;
pub mod engine;
pub mod envelope;
pub mod errors;
pub mod executors;
pub mod handle;
pub mod logging;
pub mod state;
pub mod util;
pub mod worker;
pub mod workflow;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod worker_test;
