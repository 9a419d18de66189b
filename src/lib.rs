//! Academic early-warning core: risk scoring over student profiles and marks,
//! and reconciliation of incoming mark rows against the store.

pub mod alerts;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod interventions;
pub mod logging;
pub mod models;
pub mod report;
pub mod risk;
pub mod store;
pub mod students;
