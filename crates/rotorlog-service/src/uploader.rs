// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Uploads a single bag segment: compresses it on the fly, obtains a signed upload URL from the
//! backend, and streams the object into storage.

use std::{fmt, io, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::write::GzEncoder;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use xz2::write::XzEncoder;

use crate::{bag::BagMetadata, config::KeyAlgorithm};

/// Number of in-flight chunks between the compression producer and the HTTP request body.
const PIPE_DEPTH: usize = 8;

/// Compression level used for xz streams.
const XZ_LEVEL: u32 = 6;

/// Compression applied to a segment while it is uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    /// Upload the segment as-is.
    #[default]
    None,
    /// Streaming gzip.
    Gzip,
    /// Streaming xz.
    Xz,
}

/// Error returned when parsing an unrecognized compression mode name.
#[derive(Debug, thiserror::Error)]
#[error("unknown compression mode: {0}")]
pub struct InvalidCompressionMode(pub String);

impl CompressionMode {
    /// The extension appended to the uploaded object's name.
    pub fn extension(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
            Self::Xz => ".xz",
        }
    }
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for CompressionMode {
    type Err = InvalidCompressionMode;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "xz" => Ok(Self::Xz),
            _ => Err(InvalidCompressionMode(value.to_owned())),
        }
    }
}

/// Errors raised while uploading a bag segment.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The segment contains no messages; the caller should discard it instead of retrying.
    #[error("bag contains no messages")]
    EmptyBag,

    /// The segment file could not be opened or read.
    #[error("failed to read bag: {0}")]
    Io(#[from] io::Error),

    /// The segment's message index could not be queried.
    #[error("failed to read bag metadata: {0}")]
    BagMetadata(#[from] rusqlite::Error),

    /// The upload token could not be signed.
    #[error("failed to create upload token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    /// The HTTP request could not be sent.
    #[error("failed to send request: {0}")]
    Request(#[from] reqwest::Error),

    /// The signed-URL endpoint returned a body that is not the expected JSON.
    #[error("upload URL response is invalid JSON ({body:?}): {source}")]
    InvalidUrlResponse {
        /// The parse failure.
        source: serde_json::Error,
        /// The raw response body, for the logs.
        body: String,
    },

    /// The signed-URL endpoint rejected the request.
    #[error("upload URL request failed with code {status}: {message}")]
    UrlRequest {
        /// HTTP status of the response.
        status: StatusCode,
        /// The error message reported by the backend.
        message: String,
    },

    /// The object store rejected the upload.
    #[error("upload failed with code {status}: {message}")]
    Upload {
        /// HTTP status of the response.
        status: StatusCode,
        /// The response body.
        message: String,
    },

    /// The upload was cancelled by a process shutdown.
    #[error("upload cancelled by shutdown")]
    Cancelled,
}

impl UploadError {
    /// Returns true if the segment was classified as empty and should be discarded.
    pub fn is_empty_bag(&self) -> bool {
        matches!(self, Self::EmptyBag)
    }

    /// Returns true if the upload was cancelled by a shutdown rather than failing.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Something that can upload bag segments.
///
/// The upload manager is written against this trait so that tests can substitute an
/// instrumented uploader for [`BagUploader`].
#[async_trait]
pub trait Uploader: fmt::Debug + Send + Sync {
    /// Uploads a single segment.
    async fn upload(&self, bag: &BagMetadata) -> Result<(), UploadError>;

    /// Returns a view of this uploader with a different compression mode.
    ///
    /// The receiver is unaffected, so workers holding the previous view keep their mode.
    fn with_compression(&self, mode: CompressionMode) -> Arc<dyn Uploader>;
}

/// Identity and transport for uploading segments through backend-issued signed URLs.
#[derive(Clone)]
pub struct BagUploader {
    client: reqwest::Client,
    device_id: String,
    tenant_id: String,
    backend_url: String,
    signing_key: Arc<EncodingKey>,
    algorithm: Algorithm,
    token_lifetime: Duration,
    compression: CompressionMode,
}

impl fmt::Debug for BagUploader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BagUploader")
            .field("client", &self.client)
            .field("device_id", &self.device_id)
            .field("tenant_id", &self.tenant_id)
            .field("backend_url", &self.backend_url)
            .field("signing_key", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .field("token_lifetime", &self.token_lifetime)
            .field("compression", &self.compression)
            .finish()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadClaims<'a> {
    device_id: &'a str,
    tenant_id: &'a str,
    bag_name: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "URL", default)]
    url: String,
    #[serde(rename = "Error", default)]
    error: String,
}

impl BagUploader {
    /// Creates an uploader for the given device identity.
    pub fn new(
        device_id: String,
        tenant_id: String,
        backend_url: String,
        signing_key: EncodingKey,
        key_algorithm: KeyAlgorithm,
        token_lifetime: Duration,
        compression: CompressionMode,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            device_id,
            tenant_id,
            backend_url,
            signing_key: Arc::new(signing_key),
            algorithm: key_algorithm.jwt_algorithm(),
            token_lifetime,
            compression,
        }
    }

    fn create_token(&self, bag_name: &str) -> Result<String, UploadError> {
        let now = Utc::now().timestamp();
        let claims = UploadClaims {
            device_id: &self.device_id,
            tenant_id: &self.tenant_id,
            bag_name,
            iat: now,
            exp: now + self.token_lifetime.as_secs() as i64,
        };
        Ok(jsonwebtoken::encode(
            &Header::new(self.algorithm),
            &claims,
            &self.signing_key,
        )?)
    }

    async fn request_upload_url(&self, bag_name: &str) -> Result<String, UploadError> {
        let token = self.create_token(bag_name)?;
        let response = self
            .client
            .post(format!("{}/generate-url", self.backend_url))
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        let reply: SignedUrlResponse =
            serde_json::from_str(&body).map_err(|source| UploadError::InvalidUrlResponse {
                source,
                body: body.clone(),
            })?;
        if status != StatusCode::OK {
            return Err(UploadError::UrlRequest {
                status,
                message: reply.error,
            });
        }
        Ok(reply.url)
    }

    async fn upload_stream(&self, url: &str, body: reqwest::Body) -> Result<(), UploadError> {
        let response = self.client.put(url).body(body).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            let message = response.text().await.unwrap_or_default();
            return Err(UploadError::Upload { status, message });
        }
        Ok(())
    }
}

#[async_trait]
impl Uploader for BagUploader {
    async fn upload(&self, bag: &BagMetadata) -> Result<(), UploadError> {
        let file = std::fs::File::open(&bag.path)?;
        let body = compressed_body(self.compression, file);
        let record_start = record_start_time(bag.path.clone()).await?;
        let object_name = format!(
            "{}.db3{}",
            record_start.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.compression.extension()
        );
        let upload_url = self.request_upload_url(&object_name).await?;
        self.upload_stream(&upload_url, body).await
    }

    fn with_compression(&self, mode: CompressionMode) -> Arc<dyn Uploader> {
        Arc::new(Self {
            compression: mode,
            ..self.clone()
        })
    }
}

/// Reads the earliest message timestamp recorded in the segment.
///
/// Segments are sqlite3 databases with a `messages` table whose `timestamp` column holds
/// nanoseconds since the epoch. A segment without any rows is an empty bag.
async fn record_start_time(path: PathBuf) -> Result<DateTime<Utc>, UploadError> {
    tokio::task::spawn_blocking(move || {
        let connection = rusqlite::Connection::open_with_flags(
            &path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        let timestamp: Option<i64> =
            connection.query_row("SELECT min(timestamp) FROM messages", [], |row| row.get(0))?;
        let timestamp = timestamp.ok_or(UploadError::EmptyBag)?;
        Ok(DateTime::from_timestamp_nanos(timestamp))
    })
    .await
    .expect("bag metadata read does not panic")
}

/// Turns the segment file into a request body, applying `mode` on the way.
fn compressed_body(mode: CompressionMode, file: std::fs::File) -> reqwest::Body {
    reqwest::Body::wrap_stream(compressed_chunks(mode, file))
}

/// Streams the segment file through the selected compression.
///
/// A blocking producer pushes chunks through a bounded channel which the consumer drains as the
/// request body. When the producer fails, the error is forwarded through the channel so the
/// request surfaces it instead of truncating silently.
fn compressed_chunks(
    mode: CompressionMode,
    file: std::fs::File,
) -> ReceiverStream<Result<Bytes, io::Error>> {
    let (sender, receiver) = mpsc::channel::<Result<Bytes, io::Error>>(PIPE_DEPTH);
    let error_sender = sender.clone();
    tokio::task::spawn_blocking(move || {
        let mut file = file;
        let writer = ChunkWriter { sender };
        let result = match mode {
            CompressionMode::None => copy_through(&mut file, writer),
            CompressionMode::Gzip => {
                let mut encoder = GzEncoder::new(writer, flate2::Compression::default());
                io::copy(&mut file, &mut encoder).and_then(|_| encoder.finish().map(|_| ()))
            }
            CompressionMode::Xz => {
                let mut encoder = XzEncoder::new(writer, XZ_LEVEL);
                io::copy(&mut file, &mut encoder).and_then(|_| encoder.finish().map(|_| ()))
            }
        };
        if let Err(error) = result {
            let _ = error_sender.blocking_send(Err(error));
        }
    });
    ReceiverStream::new(receiver)
}

fn copy_through(file: &mut std::fs::File, mut writer: ChunkWriter) -> io::Result<()> {
    io::copy(file, &mut writer)?;
    Ok(())
}

/// A `Write` adapter that forwards chunks into the upload body channel.
struct ChunkWriter {
    sender: mpsc::Sender<Result<Bytes, io::Error>>,
}

impl io::Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sender
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "upload body dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
