pub mod cli;
pub mod config;
pub mod logging;
pub mod replicate;
pub mod service;
