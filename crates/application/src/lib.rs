//! Application services and ports.

#![forbid(unsafe_code)]

mod config;
mod coordination_ports;
mod leader_election;
mod polling_coordinator;
mod upstream_ports;

#[cfg(test)]
mod test_support;

pub use config::{ElectionConfig, PollingConfig};
pub use coordination_ports::{CoordinationBackend, CoordinationLease};
pub use leader_election::{LeaderElection, LeadershipEvents};
pub use polling_coordinator::PollingCoordinator;
pub use upstream_ports::{ReplySender, UpdateProcessor, UpdateSession, UpdateSource};
