//! Crane control arbitration and session broker.
//!
//! Operators lease exclusive control of a crane through a shared
//! coordination store; agents drive the cranes; the broker relays traffic
//! between a crane's agent and the operator currently holding it.

pub mod auth;
pub mod broker;
pub mod cli;
pub mod config;
pub mod directory;
pub mod expiration;
pub mod heartbeat;
pub mod lease;
pub mod lock;
pub mod redis_store;
pub mod registry;
pub mod relay;
pub mod signaling;
pub mod status;
pub mod telemetry;
pub mod websocket;
