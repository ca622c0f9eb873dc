//! # Shoal
//! The client-side runtime core for a distributed document database cluster.
//!
//! This is a convenience package which includes the sub-projects within
//! Shoal, realistically you probably want to depend on the members directly:
//!
//! ### Features
//! - `shoal_config` - The typed bucket/cluster topology model and its wire-format parsing.
//! - `shoal_core` - The control plane: configuration provider, topology reconciler and
//!   partition-aware request dispatch over pooled connections.

#[cfg(feature = "shoal-config")]
pub use shoal_config as config;
#[cfg(feature = "shoal-core")]
pub use shoal_core as runtime;
