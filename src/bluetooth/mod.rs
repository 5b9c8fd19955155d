//! Bluetooth side of speaker orchestration.
//!
//! Planning, discovery coordination and the handshake run against the
//! [`bus::BusClient`] boundary; [`bluez`] is the production implementation.

pub mod bluez;
pub mod bus;
pub mod handshake;
pub mod planner;
pub mod scan;
pub mod service;
#[cfg(test)]
pub mod testing;
