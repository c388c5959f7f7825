pub mod config;
pub mod error;
pub mod manifest;
pub mod nat;
pub mod observability;
pub mod ports;
pub mod probe;
pub mod rollout;
