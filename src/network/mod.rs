//! Network Module
//!
//! Framed TCP communication with data nodes and the transaction manager,
//! behind the `NodeTransport` seam the coordinators are written against.

mod client;
pub mod protocol;

pub use client::NodeClient;
pub use protocol::{FrameHeader, NodeEnvelope, NodeRequest, NodeResponse, StoredValue};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::state::NodeDescriptor;

/// Timeout class of a node request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    /// Ordinary reads and writes
    Standard,
    /// Calculations and recovery traffic; a retry after a premature timeout
    /// could apply an increment twice
    Long,
    /// Health probes
    Ping,
    /// Standard timeout extended by a server-side wait, for lock acquisition
    Wait(std::time::Duration),
}

/// Request/response channel to data nodes
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Send a request and wait for the node's answer
    async fn call(
        &self,
        node: &NodeDescriptor,
        request: NodeRequest,
        class: TimeoutClass,
    ) -> Result<NodeResponse>;

    /// Send a request without reading an answer
    async fn cast(&self, node: &NodeDescriptor, request: NodeRequest) -> Result<()>;
}

/// Read a framed value from a reader
pub async fn read_frame<T, R>(reader: &mut R, peer: &str) -> Result<T>
where
    T: DeserializeOwned,
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_BODY {
        return Err(Error::Network(format!(
            "frame of {} bytes from {} exceeds limit",
            header.length, peer
        )));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if !header.verify(&body) {
        return Err(Error::ChecksumMismatch(peer.to_string()));
    }

    protocol::decode(&body)
}

/// Write a framed value to a writer
pub async fn write_frame<T, W>(writer: &mut W, value: &T) -> Result<()>
where
    T: Serialize,
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let body = protocol::encode(value)?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let envelope = NodeEnvelope {
            reply: true,
            request: NodeRequest::Get { key: b"k1".to_vec() },
        };
        write_frame(&mut a, &envelope).await.unwrap();
        let received: NodeEnvelope = read_frame(&mut b, "test").await.unwrap();
        assert_eq!(received, envelope);
    }

    #[tokio::test]
    async fn test_corrupt_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(1024);
        let body = protocol::encode(&NodeResponse::Pong).unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xFFFF;
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        let result: Result<NodeResponse> = read_frame(&mut b, "node-x").await;
        assert!(matches!(result, Err(Error::ChecksumMismatch(_))));
    }
}
