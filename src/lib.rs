//! goss - run commands and transfer files across a fleet of hosts over SSH

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executors;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod parser;
pub mod path_template;
pub mod printer;
pub mod retry;
pub mod templates;
pub mod transfer;
pub mod transport;
pub mod trust;
