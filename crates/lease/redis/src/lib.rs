//! Redis lease store backend for Leasehold.
//!
//! This crate provides a Redis-backed implementation of the [`LeaseStore`]
//! trait from `leasehold`.
//!
//! # Features
//!
//! - **Atomic primitives**: acquire, renew and release are each one Lua script.
//! - **Connection pooling**: Uses `deadpool-redis` for efficient connection management.
//!
//! # Lease Consistency
//!
//! | Deployment | Mutual Exclusion | Notes |
//! |------------|------------------|-------|
//! | Single instance | Strong | Full mutual exclusion while renewals keep up |
//! | Sentinel | Weak | Lease may be lost during failover |
//! | Cluster | Weak | Lease may be lost during failover |
//!
//! See the [`store`] module documentation for details.
//!
//! [`LeaseStore`]: leasehold::LeaseStore

mod config;
mod scripts;
pub mod store;

pub use config::RedisConfig;
pub use store::RedisLeaseStore;
