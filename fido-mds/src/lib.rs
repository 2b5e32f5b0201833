//! A client for the FIDO Metadata Service v3.
//!
//! The metadata service publishes a signed blob (a compact JWS) describing
//! every certified authenticator model. This crate fetches the blob, verifies
//! its signing certificate chain against a pinned trust root and the chain's
//! revocation lists, verifies the signature, and then answers lookups by
//! AAGUID, AAID or attestation certificate key identifier. Cached metadata is
//! reloaded as the blob's `nextUpdate` date and each lookup's
//! [RefreshOption] dictate.
//!
//! ```no_run
//! use fido_mds3::{ClientConfigBuilder, RefreshOption};
//!
//! # fn main() -> Result<(), fido_mds3::MdsError> {
//! let client = ClientConfigBuilder::new()?.build()?;
//! if let Some(entry) = client.find_metadata("ee882879-721c-4913-9775-3dfcce97072a", RefreshOption::Needed)? {
//!     println!("{:?}", entry.latest_status());
//! }
//! # Ok(())
//! # }
//! ```

// #![deny(warnings)]
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

pub mod chain;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod fetch;
pub mod mds;
pub mod query;
pub mod refresh;
pub mod store;
pub mod trust;

#[cfg(test)]
mod fixtures;

pub use crate::client::MdsClient;
pub use crate::config::{
    BundledConfig, ClientConfig, ClientConfigBuilder, ConfigOptions, MdsAccess, RootAccess,
};
pub use crate::envelope::EnvelopeDecoder;
pub use crate::error::{ErrorKind, MdsError, Result};
pub use crate::fetch::{Fetch, HttpFetcher};
pub use crate::mds::{AuthenticatorStatus, EntryIdentity, MetadataEntry, MetadataPayload};
pub use crate::refresh::RefreshOption;
pub use crate::store::{MetadataSnapshot, MetadataStore};
pub use crate::trust::TrustRootStore;
