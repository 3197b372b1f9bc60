//! Collaborators registered into the alert core at startup: the default
//! Investigator stand-in and the concrete Destination implementations.
//! Both are pluggable — `main.rs` is the only place that knows which
//! concrete type backs which trait object.

pub mod destinations;
pub mod investigator;

pub use destinations::{ChatDestination, RelayDestination};
pub use investigator::HeuristicInvestigator;
