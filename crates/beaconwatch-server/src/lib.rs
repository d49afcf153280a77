//! # beaconwatch-server
//!
//! HTTP server library for the beaconwatch beacon monitoring service.
//!
//! This library provides the API handlers, logging setup and state
//! management; the binary wires them to a listener and a cycle ticker.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;
