//! Lifecycle management for multi-tenant MediaWiki farms running on docker
//! compose or Kubernetes.

pub mod backup;
pub mod config;
pub mod context;
pub mod credentials;
pub mod database;
pub mod env_store;
pub mod error;
pub mod filesystem;
pub mod lifecycle;
pub mod orchestrator;
pub mod process;
pub mod registry;
pub mod routing;
pub mod runtime;
pub mod schedule;
pub mod settings;
pub mod tenants;
pub mod wikis;

#[cfg(test)]
mod testing;
