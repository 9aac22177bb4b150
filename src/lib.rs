//! Gangway: connection broker and parallel-transfer portal engine
//!
//! A front listener accepts client connections, parses their startup
//! packs off-thread, and hands admitted descriptors to a forked agent
//! factory over Unix domain sockets. Each agent serves transfer requests
//! by opening a cookie-guarded data portal with one TCP stream per
//! worker thread, or a sequenced datagram stream for lossy links.

pub mod agent;
pub mod cli;
pub mod client;
pub mod config;
pub mod crypt;
pub mod factory;
pub mod handoff;
pub mod lifecycle;
pub mod listener;
pub mod portal;
pub mod protocol;
pub mod queue;
pub mod startup;
pub mod status;
pub mod transfer;
