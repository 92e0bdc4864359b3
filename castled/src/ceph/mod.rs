//! Interaction with the storage cluster: identity, admin commands, config and keyrings.

pub mod client;
pub mod cluster;
pub mod config;
#[cfg(test)]
mod config_test;
pub mod keyring;
#[cfg(test)]
mod keyring_test;

pub use client::CephClient;
