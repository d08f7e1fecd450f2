//! Runnable node shell around `puckbots-core`.
//!
//! The core sequences payloads; this crate supplies everything around it:
//! channel-backed link implementations, the startup retry policy, the
//! controller strategies clients run per robot, the per-node turn-loop
//! runner, and an in-process cluster harness wiring nodes, clients, and a
//! coordinator together.

pub mod cluster;
pub mod controller;
pub mod links;
pub mod runner;
