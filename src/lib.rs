//! Keeps a metadata logger from mixing log segments of two master
//! epochs: watches which physical host answers for the master and
//! stops, starts, or archives-and-restarts the local logger.

pub mod address_resolver;
pub mod archive;
pub mod command;
pub mod config;
pub mod failover;
pub mod hwaddr;
pub mod orchestrator;
pub mod process_control;
pub mod shutdown;
pub mod supervisor;
