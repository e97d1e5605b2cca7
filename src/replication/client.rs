//! Clients of the leader replication API
//!
//! `HttpReplicationClient` talks to a remote leader over HTTP (optionally with
//! mutual TLS); `LocalReplicationClient` serves the same calls from an engine
//! in the same process.

use crate::common::{encode_name, Error, Reloadable, ReplicationConfig, Result};
use crate::storage::command::LogBatch;
use crate::storage::engine::Engine;
use crate::storage::snapshot::encode_transfer;
use crate::storage::tables::TableInfo;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::StatusCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Chunks of an encoded snapshot, in order
pub type SnapshotStream = BoxStream<'static, Result<Bytes>>;

/// Carries the first retained index on `410 Gone` log responses
pub const FIRST_INDEX_HEADER: &str = "x-spokekv-first-index";

pub const SNAPSHOT_CHUNK_SIZE: usize = 64 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound of a log response or snapshot chunk
pub const DEFAULT_MAX_RECV_BYTES: u64 = 8 * 1024 * 1024;

#[async_trait]
pub trait ReplicationClient: Send + Sync {
    /// Tables present on the leader
    async fn tables(&self) -> Result<Vec<TableInfo>>;

    /// Committed leader entries from `from` on, with the leader table's shard
    async fn log(&self, table: &str, from: u64, max_entries: u64) -> Result<LogBatch>;

    /// Framed snapshot of a table, see `storage::snapshot::decode_transfer`
    async fn snapshot(&self, table: &str) -> Result<SnapshotStream>;

    /// Maintenance: drop the whole content of a table
    async fn reset(&self, table: &str) -> Result<()>;
}

/// Split `bytes` into a stream of `chunk_size` pieces
pub fn chunked(bytes: Bytes, chunk_size: usize) -> SnapshotStream {
    let chunk_size = chunk_size.max(1);
    Box::pin(async_stream::stream! {
        let mut offset = 0;
        while offset < bytes.len() {
            let end = (offset + chunk_size).min(bytes.len());
            yield Ok::<Bytes, Error>(bytes.slice(offset..end));
            offset = end;
        }
    })
}

/// Encode a consistent snapshot of `table` and stream it
pub async fn snapshot_stream(engine: &Engine, table: &str) -> Result<SnapshotStream> {
    let snapshot = engine.snapshot(table)?;
    let encoded = tokio::task::spawn_blocking(move || encode_transfer(&snapshot))
        .await
        .map_err(|e| Error::Internal(format!("snapshot encoding task failed: {}", e)))??;

    tracing::debug!(table, bytes = encoded.len(), "Streaming snapshot");
    Ok(chunked(Bytes::from(encoded), SNAPSHOT_CHUNK_SIZE))
}

struct ClientTls {
    credential: Arc<Reloadable>,
    ca_pem: Vec<u8>,
}

fn build_client(tls: Option<&ClientTls>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .no_proxy()
        .connect_timeout(CONNECT_TIMEOUT);

    if let Some(tls) = tls {
        let identity = reqwest::Identity::from_pem(&tls.credential.current().identity_pem())
            .map_err(|e| Error::Tls(format!("invalid client identity: {}", e)))?;
        let ca = reqwest::Certificate::from_pem(&tls.ca_pem)
            .map_err(|e| Error::Tls(format!("invalid CA certificate: {}", e)))?;
        builder = builder
            .use_rustls_tls()
            .add_root_certificate(ca)
            .identity(identity);
    }

    Ok(builder.build()?)
}

pub struct HttpReplicationClient {
    base_url: String,
    tls: Option<ClientTls>,
    /// Client and the credential generation it was built with
    client: Mutex<(u64, reqwest::Client)>,
    max_recv_bytes: u64,
}

impl HttpReplicationClient {
    /// Plain HTTP client
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tls: None,
            client: Mutex::new((0, build_client(None)?)),
            max_recv_bytes: DEFAULT_MAX_RECV_BYTES,
        })
    }

    /// Mutual TLS client, rebuilt whenever `credential` is reloaded
    pub fn with_tls(
        base_url: impl Into<String>,
        credential: Arc<Reloadable>,
        ca_pem: Vec<u8>,
    ) -> Result<Self> {
        let tls = ClientTls { credential, ca_pem };
        let client = build_client(Some(&tls))?;
        let generation = tls.credential.generation();

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tls: Some(tls),
            client: Mutex::new((generation, client)),
            max_recv_bytes: DEFAULT_MAX_RECV_BYTES,
        })
    }

    /// Reject log responses and snapshot chunks larger than `limit` bytes
    pub fn max_recv_bytes(mut self, limit: u64) -> Self {
        self.max_recv_bytes = limit;
        self
    }

    pub fn from_config(config: &ReplicationConfig) -> Result<Self> {
        let client = match &config.tls {
            None => Self::new(&config.leader_address),
            Some(tls) => {
                let credential = Arc::new(Reloadable::new(&tls.cert_filename, &tls.key_filename)?);
                let ca_pem = std::fs::read(&tls.ca_filename).map_err(|e| {
                    Error::Tls(format!(
                        "failed to read CA file {}: {}",
                        tls.ca_filename.display(),
                        e
                    ))
                })?;
                Self::with_tls(&config.leader_address, credential, ca_pem)
            }
        }?;
        Ok(client.max_recv_bytes(config.max_recv_message_size_bytes))
    }

    /// Credential used for mutual TLS, if any
    pub fn credential(&self) -> Option<Arc<Reloadable>> {
        self.tls.as_ref().map(|tls| tls.credential.clone())
    }

    fn client(&self) -> Result<reqwest::Client> {
        let mut cached = self.client.lock().unwrap();
        if let Some(tls) = &self.tls {
            let generation = tls.credential.generation();
            if cached.0 != generation {
                *cached = (generation, build_client(Some(tls))?);
                tracing::debug!(generation, "Replication client rebuilt with new certificate");
            }
        }
        Ok(cached.1.clone())
    }

    fn table_url(&self, table: &str, tail: &str) -> String {
        format!("{}/v1/tables/{}/{}", self.base_url, encode_name(table), tail)
    }
}

/// Map error statuses of the replication API back to errors
async fn check(resp: reqwest::Response, table: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let first_index = resp
        .headers()
        .get(FIRST_INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let body = resp.text().await.unwrap_or_default();

    Err(match status {
        StatusCode::GONE => Error::Compacted(first_index.unwrap_or(0)),
        StatusCode::NOT_FOUND => Error::TableNotFound(table.to_string()),
        StatusCode::SERVICE_UNAVAILABLE => Error::Unavailable(0, body),
        StatusCode::GATEWAY_TIMEOUT => Error::Timeout(body),
        _ => Error::Http(format!("{}: {}", status, body)),
    })
}

/// Read a whole response body, failing once it grows past `limit`
async fn read_body(resp: reqwest::Response, limit: u64) -> Result<Vec<u8>> {
    if let Some(size) = resp.content_length() {
        if size > limit {
            return Err(Error::MessageTooLarge { size, limit });
        }
    }

    let mut body = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let size = (body.len() + chunk.len()) as u64;
        if size > limit {
            return Err(Error::MessageTooLarge { size, limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

#[async_trait]
impl ReplicationClient for HttpReplicationClient {
    async fn tables(&self) -> Result<Vec<TableInfo>> {
        let url = format!("{}/v1/tables", self.base_url);
        let resp = check(self.client()?.get(url).send().await?, "").await?;
        Ok(serde_json::from_slice(&resp.bytes().await?)?)
    }

    async fn log(&self, table: &str, from: u64, max_entries: u64) -> Result<LogBatch> {
        let url = self.table_url(table, "log");
        let resp = self
            .client()?
            .get(url)
            .query(&[("from", from), ("max", max_entries)])
            .send()
            .await?;
        let resp = check(resp, table).await?;
        Ok(bincode::deserialize(&read_body(resp, self.max_recv_bytes).await?)?)
    }

    async fn snapshot(&self, table: &str) -> Result<SnapshotStream> {
        let url = self.table_url(table, "snapshot");
        let resp = check(self.client()?.get(url).send().await?, table).await?;
        let limit = self.max_recv_bytes;
        Ok(resp
            .bytes_stream()
            .map(move |chunk| {
                let chunk = chunk?;
                if chunk.len() as u64 > limit {
                    return Err(Error::MessageTooLarge {
                        size: chunk.len() as u64,
                        limit,
                    });
                }
                Ok(chunk)
            })
            .boxed())
    }

    async fn reset(&self, table: &str) -> Result<()> {
        let url = self.table_url(table, "reset");
        check(self.client()?.post(url).send().await?, table).await?;
        Ok(())
    }
}

/// Replication calls served by an engine in the same process
pub struct LocalReplicationClient {
    engine: Arc<Engine>,
}

impl LocalReplicationClient {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ReplicationClient for LocalReplicationClient {
    async fn tables(&self) -> Result<Vec<TableInfo>> {
        self.engine.list_tables()
    }

    async fn log(&self, table: &str, from: u64, max_entries: u64) -> Result<LogBatch> {
        self.engine.log_reader().query(table, from, max_entries)
    }

    async fn snapshot(&self, table: &str) -> Result<SnapshotStream> {
        snapshot_stream(&self.engine, table).await
    }

    async fn reset(&self, table: &str) -> Result<()> {
        self.engine.reset_table(table).await
    }
}
