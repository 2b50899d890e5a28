//! stowage-s3: S3 backend for the stowage transfer engine
//!
//! This crate implements `ChunkTransport` and `ObjectStore` from
//! stowage-core on top of aws-sdk-s3. It is the only crate that directly
//! depends on the AWS SDK.

use std::sync::Arc;

use stowage_core::{DataClient, ProfileManager, Result};

pub mod classify;
pub mod client;
pub mod multipart;

pub use client::S3Client;

/// Open a client for the profile called `name`.
///
/// The profile supplies the endpoint, credentials, token and retry override;
/// the configuration file's defaults supply chunk size and public spaces.
/// Multipart parts follow the chunk size, raised to the S3 minimum.
pub async fn connect(profiles: &ProfileManager, name: &str) -> Result<DataClient> {
    let (profile, config) = profiles.client_config(name)?;
    let backend = S3Client::new(profile)
        .await?
        .with_part_size(config.transfer.chunk_size);
    DataClient::new(Arc::new(backend), config)
}
