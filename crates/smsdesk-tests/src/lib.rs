//! End-to-end scenarios: a real server on a loopback port, driven through
//! the carrier webhook, the REST client and both real-time transports.

pub mod harness;
