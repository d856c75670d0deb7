//! Lornu AI Posture
//!
//! Fetch orchestration for security posture scans: periodic cycles over a
//! registry of fetchers, per-cycle caching, dynamically refreshed fetcher
//! sets and multi-account fan-in.

pub mod benchmark;
pub mod config;
pub mod error;
pub mod fetching;

pub use benchmark::{Benchmark, BenchmarkBuilder, OrganizationStrategy, RegistryStrategy};
pub use config::{BenchmarkKind, FetchingConfig};
pub use error::{BuildError, ConfigError, FetchError, ManagerError};
