//! S3 client implementation
//!
//! Wraps aws-sdk-s3 and implements `ChunkTransport` and `ObjectStore` from
//! stowage-core. Uploads become multipart uploads, downloads are served by
//! ranged `GetObject` calls after a `HeadObject` probe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_smithy_types::byte_stream::ByteStream;
use bytes::Bytes;
use tracing::debug;

use stowage_core::{
    Authorization, ChunkRead, ChunkTransport, DownloadSession, Error, ObjectInfo, ObjectStore,
    Profile, Result, SessionHandle, UploadMetadata,
};

use crate::classify::{classify, is_range_not_satisfiable};
use crate::multipart::{UploadState, part_size_for};

/// Send a fluent request, attaching the bearer token header when present
macro_rules! send_authorized {
    ($client:expr, $request:expr, $auth:expr) => {{
        let op = $request.customize();
        match $client.token_header($auth) {
            Some((name, value)) => {
                op.mutate_request(move |req| {
                    req.headers_mut().insert(name.clone(), value.clone());
                })
                .send()
                .await
            }
            None => op.send().await,
        }
    }};
}

type SharedUpload = Arc<tokio::sync::Mutex<UploadState>>;

/// S3 client wrapper
pub struct S3Client {
    inner: aws_sdk_s3::Client,
    profile: Profile,
    part_size: u64,
    uploads: Mutex<HashMap<String, SharedUpload>>,
    next_download: AtomicU64,
}

impl S3Client {
    /// Create a new S3 client from a profile
    pub async fn new(profile: Profile) -> Result<Self> {
        profile.validate()?;

        let credentials = aws_credential_types::Credentials::new(
            profile.access_key.clone(),
            profile.secret_key.clone(),
            None,
            None,
            "stowage-static-credentials",
        );

        let timeouts = profile.timeout_config();
        let timeout_config = aws_config::timeout::TimeoutConfig::builder()
            .connect_timeout(Duration::from_millis(timeouts.connect_ms))
            .read_timeout(Duration::from_millis(timeouts.read_ms))
            .build();

        // The transfer engine owns retries; the SDK must not retry underneath it.
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(aws_config::Region::new(profile.region.clone()))
            .endpoint_url(&profile.endpoint)
            .timeout_config(timeout_config)
            .retry_config(aws_config::retry::RetryConfig::disabled())
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            .force_path_style(true)
            .build();

        Ok(Self {
            inner: aws_sdk_s3::Client::from_conf(s3_config),
            profile,
            part_size: part_size_for(stowage_core::config::DEFAULT_CHUNK_SIZE),
            uploads: Mutex::new(HashMap::new()),
            next_download: AtomicU64::new(1),
        })
    }

    /// Gather chunks into parts of `part_size` bytes (clamped to S3 limits)
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size_for(part_size);
        self
    }

    /// Get the underlying aws-sdk-s3 client
    pub fn inner(&self) -> &aws_sdk_s3::Client {
        &self.inner
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    fn bucket(&self, space: &str) -> String {
        self.profile.bucket_for(space)
    }

    fn token_header(&self, auth: &Authorization) -> Option<(String, String)> {
        auth.token()
            .map(|token| (self.profile.token_header.clone(), token.to_string()))
    }

    fn upload(&self, session: &SessionHandle) -> Result<SharedUpload> {
        self.uploads
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&session.id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Upload session {}", session.id)))
    }

    fn forget(&self, session: &SessionHandle) {
        self.uploads
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&session.id);
    }

    /// Send every queued part, oldest first
    async fn flush_parts(&self, state: &mut UploadState, auth: &Authorization) -> Result<()> {
        while let Some(part) = state.next_ready() {
            let context = format!("{}/{} part {}", state.bucket, state.key, part.part_number);
            let request = self
                .inner
                .upload_part()
                .bucket(&state.bucket)
                .key(&state.key)
                .upload_id(&state.upload_id)
                .part_number(part.part_number)
                .content_length(part.body.len() as i64)
                .body(ByteStream::from(part.body.clone()));
            let response =
                send_authorized!(self, request, auth).map_err(|e| classify(&e, &context))?;

            let etag = response
                .e_tag()
                .map(|t| t.to_string())
                .ok_or_else(|| Error::General(format!("{context}: missing ETag")))?;
            debug!(upload_id = %state.upload_id, part = part.part_number, size = part.body.len(), "Part uploaded");
            state.complete(part.part_number, etag);
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkTransport for S3Client {
    async fn open_upload(
        &self,
        space: &str,
        key: &str,
        metadata: &UploadMetadata,
        auth: &Authorization,
    ) -> Result<SessionHandle> {
        let bucket = self.bucket(space);
        let mut request = self
            .inner
            .create_multipart_upload()
            .bucket(&bucket)
            .key(key);
        if let Some(ct) = &metadata.content_type {
            request = request.content_type(ct);
        }
        for (name, value) in &metadata.user {
            request = request.metadata(name, value);
        }

        let response = send_authorized!(self, request, auth)
            .map_err(|e| classify(&e, &format!("{space}/{key}")))?;
        let upload_id = response
            .upload_id()
            .ok_or_else(|| Error::General("CreateMultipartUpload returned no upload id".into()))?
            .to_string();

        let state = UploadState::new(&upload_id, &bucket, key, self.part_size);
        self.uploads
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(upload_id.clone(), Arc::new(tokio::sync::Mutex::new(state)));
        debug!(%bucket, key, %upload_id, "Multipart upload created");

        Ok(SessionHandle {
            id: upload_id,
            space: space.to_string(),
            key: key.to_string(),
        })
    }

    async fn send_chunk(
        &self,
        session: &SessionHandle,
        offset: u64,
        chunk: Bytes,
        auth: &Authorization,
    ) -> Result<()> {
        let upload = self.upload(session)?;
        let mut state = upload.lock().await;
        state.accept(offset, &chunk)?;
        self.flush_parts(&mut state, auth).await
    }

    async fn finalize_upload(&self, session: &SessionHandle, auth: &Authorization) -> Result<()> {
        let upload = self.upload(session)?;
        let mut state = upload.lock().await;
        state.seal()?;
        self.flush_parts(&mut state, auth).await?;

        let parts: Vec<CompletedPart> = state
            .completed_parts()
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();
        let request = self
            .inner
            .complete_multipart_upload()
            .bucket(&state.bucket)
            .key(&state.key)
            .upload_id(&state.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            );
        send_authorized!(self, request, auth)
            .map_err(|e| classify(&e, &format!("{}/{}", session.space, session.key)))?;

        debug!(upload_id = %state.upload_id, bytes = state.accepted_bytes(), "Multipart upload completed");
        drop(state);
        self.forget(session);
        Ok(())
    }

    async fn abort_upload(&self, session: &SessionHandle, auth: &Authorization) -> Result<()> {
        let bucket = self.bucket(&session.space);
        self.forget(session);
        let request = self
            .inner
            .abort_multipart_upload()
            .bucket(&bucket)
            .key(&session.key)
            .upload_id(&session.id);
        send_authorized!(self, request, auth)
            .map_err(|e| classify(&e, &format!("{}/{}", session.space, session.key)))?;
        debug!(upload_id = %session.id, "Multipart upload aborted");
        Ok(())
    }

    async fn open_download(
        &self,
        space: &str,
        key: &str,
        auth: &Authorization,
    ) -> Result<DownloadSession> {
        let info = self.head_object(space, key, auth).await?;
        let id = format!(
            "get-{}",
            self.next_download.fetch_add(1, Ordering::Relaxed)
        );
        Ok(DownloadSession {
            session: SessionHandle {
                id,
                space: space.to_string(),
                key: key.to_string(),
            },
            total_bytes: Some(info.size_bytes),
            metadata: info.metadata,
        })
    }

    async fn receive_chunk(
        &self,
        session: &SessionHandle,
        offset: u64,
        max_len: u64,
        auth: &Authorization,
    ) -> Result<ChunkRead> {
        if max_len == 0 {
            return Ok(ChunkRead::Eof);
        }
        let end = offset.saturating_add(max_len - 1);
        let request = self
            .inner
            .get_object()
            .bucket(self.bucket(&session.space))
            .key(&session.key)
            .range(format!("bytes={offset}-{end}"));

        let response = match send_authorized!(self, request, auth) {
            Ok(response) => response,
            Err(e) if is_range_not_satisfiable(&e) => return Ok(ChunkRead::Eof),
            Err(e) => {
                return Err(classify(&e, &format!("{}/{}", session.space, session.key)));
            }
        };

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| Error::Network(format!("{}/{}: {e}", session.space, session.key)))?
            .into_bytes();
        if body.is_empty() {
            Ok(ChunkRead::Eof)
        } else {
            Ok(ChunkRead::Data(body))
        }
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn head_object(
        &self,
        space: &str,
        key: &str,
        auth: &Authorization,
    ) -> Result<ObjectInfo> {
        let request = self
            .inner
            .head_object()
            .bucket(self.bucket(space))
            .key(key);
        let response = send_authorized!(self, request, auth)
            .map_err(|e| classify(&e, &format!("{space}/{key}")))?;

        let size = response.content_length().unwrap_or(0).max(0) as u64;
        let mut info = ObjectInfo::file(key, size);

        if let Some(modified) = response.last_modified() {
            info.last_modified = jiff::Timestamp::from_second(modified.secs()).ok();
        }

        if let Some(etag) = response.e_tag() {
            info.etag = Some(etag.trim_matches('"').to_string());
        }

        if let Some(ct) = response.content_type() {
            info.content_type = Some(ct.to_string());
        }

        if let Some(metadata) = response.metadata() {
            info.metadata = metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        }

        Ok(info)
    }
}

impl std::fmt::Debug for S3Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Client")
            .field("profile", &self.profile.name)
            .field("endpoint", &self.profile.endpoint)
            .field("part_size", &self.part_size)
            .finish_non_exhaustive()
    }
}
