//! Broker clients
//!
//! This module provides:
//! - [`BrokerClient`] trait: connect, fetch, ack, reject
//! - [`InMemoryBroker`] for tests and `memory://` deployments
//! - [`PostgresBroker`] for production

mod client;
mod memory;
mod postgres;

pub use client::{BrokerClient, BrokerError, Requeue, MAX_SCHEDULE_DELAY};
pub use memory::{BrokerEvent, InMemoryBroker};
pub use postgres::PostgresBroker;
