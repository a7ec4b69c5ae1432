//! # CIRRUS - Encrypted Cloud Drive Engine
//!
//! The client-side core of the Cirrus cloud drive: a user-space virtual
//! filesystem backed by a remote object store.
//!
//! ## Architecture
//!
//! - `config`: Engine configuration constructed at login
//! - `api`: Seam to the pooled API client and content hosts
//! - `store`: Local metadata rows over an embedded key-value store
//! - `keycache`: Ephemeral registry for expensive-to-rebuild objects
//! - `crypto`: End-to-end encryption key vault, name and sector codecs
//! - `pagecache`: Two-tier read cache with readahead and request coalescing
//!
//! The crate deliberately does not implement login/session handling, the
//! transport protocol, sync diffing, or the filesystem front-end; those are
//! collaborators reached through the `api` and `store` seams.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Engine configuration
pub mod config;

// API client seam
pub mod api;

// Local metadata persistence
pub mod store;

// Ephemeral object registry
pub mod keycache;

// End-to-end encryption core
pub mod crypto;

// Read page cache
pub mod pagecache;

// Re-export commonly used types
pub use config::CoreConfig;
pub use crypto::vault::KeyVault;
pub use keycache::CacheManager;
pub use pagecache::PageCache;

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
