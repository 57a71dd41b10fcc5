//! Authenticated framed binary channel between the orchestrator and a worker.
//!
//! Wire format (all integers little-endian, floats IEEE-754 binary32):
//! request  = `u32 tensor_len ‖ f32[tensor_len] ‖ hmac_sha256(32)`
//! response = `u8 status ‖ u32 tensor_len ‖ f32[tensor_len] ‖ hmac_sha256(32)`
//! HMAC covers every byte preceding the tag. `status`: 0 ok, 1 hmac error, 2
//! compute error; a non-zero status always carries `tensor_len = 0`.

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use hmac::{Hmac, Mac};
use mesh_core::{MeshError, Vector};
use sha2::Sha256;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

const STATUS_OK: u8 = 0;
const STATUS_HMAC_ERROR: u8 = 1;
const STATUS_COMPUTE_ERROR: u8 = 2;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("hmac verification failed")]
    Hmac,
    #[error("unrecognized status byte {0}")]
    BadStatus(u8),
}

fn hmac_tag(secret: &[u8], payload: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(payload);
    mac.finalize().into_bytes().into()
}

fn verify_hmac(secret: &[u8], payload: &[u8], tag: &[u8]) -> Result<(), RelayError> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(payload);
    mac.verify_slice(tag).map_err(|_| RelayError::Hmac)
}

fn encode_tensor(dst: &mut BytesMut, tensor: &Vector) {
    dst.put_u32_le(tensor.len() as u32);
    for f in tensor {
        dst.put_f32_le(*f);
    }
}

/// Server-side codec: decodes requests, encodes responses.
struct ServerCodec {
    secret: Arc<Vec<u8>>,
}

impl Decoder for ServerCodec {
    type Item = Vector;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let tensor_len = u32::from_le_bytes(src[0..4].try_into().unwrap()) as usize;
        let frame_len = 4 + tensor_len * 4 + 32;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len);
        let payload = &frame[..4 + tensor_len * 4];
        let tag = &frame[4 + tensor_len * 4..];
        verify_hmac(&self.secret, payload, tag)?;

        let tensor = frame[4..4 + tensor_len * 4]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        Ok(Some(tensor))
    }
}

enum ServerResponse {
    Ok(Vector),
    HmacError,
    ComputeError,
}

impl Encoder<ServerResponse> for ServerCodec {
    type Error = RelayError;

    fn encode(&mut self, item: ServerResponse, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        match item {
            ServerResponse::Ok(tensor) => {
                payload.put_u8(STATUS_OK);
                encode_tensor(&mut payload, &tensor);
            }
            ServerResponse::HmacError => {
                payload.put_u8(STATUS_HMAC_ERROR);
                payload.put_u32_le(0);
            }
            ServerResponse::ComputeError => {
                payload.put_u8(STATUS_COMPUTE_ERROR);
                payload.put_u32_le(0);
            }
        }
        let tag = hmac_tag(&self.secret, &payload);
        dst.extend_from_slice(&payload);
        dst.extend_from_slice(&tag);
        Ok(())
    }
}

/// Client-side codec: encodes requests, decodes responses.
struct ClientCodec {
    secret: Arc<Vec<u8>>,
}

impl Encoder<Vector> for ClientCodec {
    type Error = RelayError;

    fn encode(&mut self, tensor: Vector, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        encode_tensor(&mut payload, &tensor);
        let tag = hmac_tag(&self.secret, &payload);
        dst.extend_from_slice(&payload);
        dst.extend_from_slice(&tag);
        Ok(())
    }
}

pub enum RelayResponse {
    Ok(Vector),
    HmacError,
    ComputeError,
}

impl Decoder for ClientCodec {
    type Item = RelayResponse;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 5 {
            return Ok(None);
        }
        let status = src[0];
        let tensor_len = u32::from_le_bytes(src[1..5].try_into().unwrap()) as usize;
        let frame_len = 5 + tensor_len * 4 + 32;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len);
        let payload = &frame[..5 + tensor_len * 4];
        let tag = &frame[5 + tensor_len * 4..];
        verify_hmac(&self.secret, payload, tag)?;

        match status {
            STATUS_OK => {
                let tensor = frame[5..5 + tensor_len * 4]
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                    .collect();
                Ok(Some(RelayResponse::Ok(tensor)))
            }
            STATUS_HMAC_ERROR => Ok(Some(RelayResponse::HmacError)),
            STATUS_COMPUTE_ERROR => Ok(Some(RelayResponse::ComputeError)),
            other => Err(RelayError::BadStatus(other)),
        }
    }
}

/// Runs a single layer's compute. Two deployment shapes share this contract:
/// a deterministic simulation for tests and an adapter forwarding to an
/// external inference engine.
#[async_trait]
pub trait ComputeFn: Send + Sync {
    async fn compute(&self, input: Vector, layer_index: u32) -> anyhow::Result<Vector>;
}

/// Worker-side server: accepts connections, authenticates each frame, and
/// runs the configured contiguous layer range over every accepted tensor.
/// Every connection is isolated — its own framing state, no shared mutable
/// state leaks between connections.
pub struct LayerRangeServer {
    secret: Arc<Vec<u8>>,
    start_layer: u32,
    end_layer: u32,
    compute: Arc<dyn ComputeFn>,
}

impl LayerRangeServer {
    pub fn new(secret: Vec<u8>, start_layer: u32, end_layer: u32, compute: Arc<dyn ComputeFn>) -> Self {
        Self {
            secret: Arc::new(secret),
            start_layer,
            end_layer,
            compute,
        }
    }

    /// `for layer in start_layer..=end_layer { current = compute(current, layer) }`.
    /// No layer is skipped or reordered.
    pub async fn forward(&self, input: Vector) -> anyhow::Result<Vector> {
        let mut current = input;
        for layer in self.start_layer..=self.end_layer {
            current = self.compute.compute(current, layer).await?;
        }
        Ok(current)
    }

    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    debug!(%peer, error = %e, "relay connection ended");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> std::io::Result<()> {
        let codec = ServerCodec {
            secret: self.secret.clone(),
        };
        let mut framed = Framed::new(stream, codec);
        loop {
            use futures::{SinkExt, StreamExt};
            let frame = match framed.next().await {
                Some(Ok(tensor)) => tensor,
                Some(Err(RelayError::Hmac)) => {
                    framed.send(ServerResponse::HmacError).await.ok();
                    continue;
                }
                Some(Err(RelayError::Io(e))) => return Err(e),
                Some(Err(e)) => {
                    warn!(error = %e, "malformed relay frame");
                    return Ok(());
                }
                None => return Ok(()),
            };

            match self.forward(frame).await {
                Ok(output) => {
                    framed.send(ServerResponse::Ok(output)).await.ok();
                }
                Err(e) => {
                    warn!(error = %e, "compute failed");
                    framed.send(ServerResponse::ComputeError).await.ok();
                }
            }
        }
    }
}

/// Orchestrator-side client. `send` connects, sends one framed message,
/// awaits one framed response, and closes — no connection pooling.
pub struct RelayClient {
    secret: Arc<Vec<u8>>,
}

impl RelayClient {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret: Arc::new(secret),
        }
    }

    pub async fn send(&self, addr: &str, input: Vector, timeout: Duration) -> Result<Vector, MeshError> {
        use futures::{SinkExt, StreamExt};

        let connect = tokio::time::timeout(timeout, TcpStream::connect(addr));
        let stream = match connect.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(_)) => return Err(MeshError::ConnectRefused(addr.to_string())),
            Err(_) => return Err(MeshError::Timeout(timeout.as_millis() as u64)),
        };

        let codec = ClientCodec {
            secret: self.secret.clone(),
        };
        let mut framed = Framed::new(stream, codec);

        framed
            .send(input)
            .await
            .map_err(|_| MeshError::WorkerUnreachable(addr.to_string()))?;

        let response = tokio::time::timeout(timeout, framed.next()).await;
        match response {
            Ok(Some(Ok(RelayResponse::Ok(tensor)))) => Ok(tensor),
            Ok(Some(Ok(RelayResponse::HmacError))) => Err(MeshError::HmacError),
            Ok(Some(Ok(RelayResponse::ComputeError))) => {
                Err(MeshError::ComputeError(format!("worker {addr} reported a compute failure")))
            }
            Ok(Some(Err(_))) | Ok(None) => Err(MeshError::WorkerUnreachable(addr.to_string())),
            Err(_) => Err(MeshError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Retries once, after `backoff`, but only on transport failure
    /// (`Timeout`/`ConnectRefused`/`WorkerUnreachable`) — `HmacError` and
    /// `ComputeError` are answers from a live peer, not transport faults,
    /// and retrying them would just repeat the same verdict.
    pub async fn send_with_retry(
        &self,
        addr: &str,
        input: Vector,
        timeout: Duration,
        backoff: Duration,
    ) -> Result<Vector, MeshError> {
        match self.send(addr, input.clone(), timeout).await {
            Ok(output) => Ok(output),
            Err(MeshError::Timeout(_)) | Err(MeshError::ConnectRefused(_)) | Err(MeshError::WorkerUnreachable(_)) => {
                tokio::time::sleep(backoff).await;
                self.send(addr, input, timeout).await
            }
            Err(e) => Err(e),
        }
    }
}
