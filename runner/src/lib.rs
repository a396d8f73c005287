pub mod archive;
pub mod compiler;
pub mod config;
pub mod ledger;
pub mod model;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod template;
pub mod tracker;
pub mod tunnel;

#[cfg(test)]
mod config_test;
#[cfg(test)]
mod tracker_test;
