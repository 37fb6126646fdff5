//! Fides
//!
//! Registers a Kubernetes cluster's service-account OIDC issuer with the
//! fides trust registry and keeps the published discovery metadata fresh.

pub mod config;
pub mod controller;
pub mod health;
pub mod types;
pub mod version;
