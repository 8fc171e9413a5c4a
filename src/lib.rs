// src/lib.rs

// 1. Data Structures (The "Nouns")
// explicit 'pub' makes them available to main.rs
pub mod models;

// 2. Interfaces (The "Contract")
pub mod traits;

// 3. Error Taxonomy
pub mod error;

// 4. Adapters (The "Plumbing")
pub mod connectors;

// 5. Deposit Ratio Divider (The "Arithmetic")
pub mod divider;

// 6. Allocation Providers (The "Advisors")
pub mod allocation;

// 7. Batch Engine (The "Orchestrator")
pub mod engine;

// 8. Configuration
pub mod config;
