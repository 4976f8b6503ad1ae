//! Deployment module

pub mod archive;
pub mod cleanup;
pub mod coordinator;
pub mod docker;
pub mod fsm;
pub mod git;
pub mod manifest;
pub mod orchestrator;
pub mod ports;
pub mod routing;
pub mod source;
