// src/connectors/mod.rs
//
// Pluggable implementations of the engine's external interfaces: yield
// source adapters and price oracles. Production deployments register their
// own; the simulated ones here back the demo binary and the test suite.

pub mod oracle;
pub mod simulated;

pub use oracle::StaticPriceOracle;
pub use simulated::SimulatedYieldAdapter;
