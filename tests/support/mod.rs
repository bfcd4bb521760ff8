#![allow(dead_code)]

pub mod agent_env;
pub mod files;
pub mod transport;
