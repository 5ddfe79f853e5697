pub mod boot;
pub mod config;
pub mod disk;
pub mod error;
pub mod file;
pub mod host;
pub mod logging;
pub mod paths;
pub mod recovery;

#[macro_use]
extern crate log;
