//! Testing utilities and mock implementations
//!
//! In-memory stand-ins for the link, the command stages and the delivery paths, so the client
//! and the services can be tested without a broker.

pub mod mocks;

pub use mocks::*;
