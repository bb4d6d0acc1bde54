//! Reef CA — the cluster certificate authority.
//!
//! Provides the root of trust (creation, validation, cross-signing),
//! node certificate issuance and renewal over a pluggable transport,
//! an encrypted-at-rest key store, an external signer client, and the
//! manager-side reconciliation loop that drives cluster-wide root
//! rotation to convergence.

pub mod api;
pub mod error;
pub mod external;
pub mod issuance;
pub mod keystore;
pub mod paths;
pub mod renewer;
pub mod rootca;
pub mod server;
pub mod store;

pub use error::CaError;
pub use keystore::KeyReadWriter;
pub use rootca::{RootCa, SharedRootCa};
pub use server::CaServer;
