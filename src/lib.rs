//! Lazygate - a reverse proxy that wakes compose services on demand
//!
//! This library provides a lazy activation layer for a fleet of
//! compose-managed containers:
//! - Routes HTTP traffic to backends named by the `x-target-service` header
//! - Starts a service's container on demand when traffic arrives, waiting
//!   until its TCP port accepts connections
//! - Serializes concurrent cold starts so one compose invocation serves
//!   an entire burst of requests
//! - Tracks per-service activity and in-flight request counts
//! - Stops containers that have been idle past a configurable timeout,
//!   cascading to their unprotected dependencies

pub mod activity;
pub mod config;
pub mod controller;
pub mod docker;
pub mod error;
pub mod manifest;
pub mod proxy;
pub mod reaper;
