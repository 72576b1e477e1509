pub mod command;
pub mod completion;
pub mod config;
pub mod context;
pub mod database;
pub mod executors;
pub mod extract;
pub mod layout;
pub mod logging;
pub mod nodes;
pub mod staging;
pub mod staleness;
pub mod workloads;

#[cfg(test)]
mod completion_test;
#[cfg(test)]
mod config_test;
