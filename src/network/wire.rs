// Wire Framing
//
// INTENTION: Every connection in the graph (registry calls, topic streams,
// service calls) carries length-prefixed bincode frames: a 4-byte big-endian
// body length followed by the body. This module owns that encoding so the
// layers above only ever send and receive typed values.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{GraphError, GraphResult};
use crate::network::Endpoint;

/// Largest frame body accepted in either direction
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Serialize `value` into a complete frame (prefix included)
pub fn encode_frame<T: Serialize>(value: &T) -> GraphResult<Vec<u8>> {
    let body = bincode::serialize(value)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(GraphError::Codec(format!(
            "frame of {} bytes exceeds limit of {} bytes",
            body.len(),
            MAX_FRAME_LEN
        )));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reading half of a framed connection
pub struct FrameReader {
    inner: OwnedReadHalf,
    peer: String,
}

impl FrameReader {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Read the next frame; `Ok(None)` on a clean close between frames
    pub async fn recv<T: DeserializeOwned>(&mut self) -> GraphResult<Option<T>> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(GraphError::transport(&self.peer, e)),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(GraphError::Codec(format!(
                "peer {} announced a {} byte frame, limit is {}",
                self.peer, len, MAX_FRAME_LEN
            )));
        }

        let mut body = vec![0u8; len];
        self.inner
            .read_exact(&mut body)
            .await
            .map_err(|e| GraphError::transport(&self.peer, e))?;
        Ok(Some(bincode::deserialize(&body)?))
    }

    /// Like `recv`, but a close is an error
    pub async fn expect<T: DeserializeOwned>(&mut self) -> GraphResult<T> {
        self.recv().await?.ok_or_else(|| {
            GraphError::transport(
                &self.peer,
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed"),
            )
        })
    }
}

/// Writing half of a framed connection
pub struct FrameWriter {
    inner: OwnedWriteHalf,
    peer: String,
}

impl FrameWriter {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send<T: Serialize>(&mut self, value: &T) -> GraphResult<()> {
        let frame = encode_frame(value)?;
        self.send_raw(&frame).await
    }

    /// Write a frame produced by `encode_frame`
    pub async fn send_raw(&mut self, frame: &[u8]) -> GraphResult<()> {
        self.inner
            .write_all(frame)
            .await
            .map_err(|e| GraphError::transport(&self.peer, e))?;
        self.inner
            .flush()
            .await
            .map_err(|e| GraphError::transport(&self.peer, e))
    }

    /// Flush and close the write direction
    pub async fn close(mut self) {
        let _ = self.inner.shutdown().await;
    }
}

/// A TCP stream speaking the frame protocol in both directions
pub struct FramedConnection {
    pub reader: FrameReader,
    pub writer: FrameWriter,
}

impl FramedConnection {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        Self {
            reader: FrameReader {
                inner: read,
                peer: peer.clone(),
            },
            writer: FrameWriter { inner: write, peer },
        }
    }

    /// Open a connection to `endpoint`, giving up after `timeout`
    pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> GraphResult<Self> {
        let target = endpoint.to_string();
        let stream = tokio::time::timeout(timeout, TcpStream::connect((endpoint.host.as_str(), endpoint.port)))
            .await
            .map_err(|_| GraphError::Timeout(timeout))?
            .map_err(|e| GraphError::transport(&target, e))?;
        Ok(Self::new(stream))
    }

    pub fn peer(&self) -> &str {
        self.reader.peer()
    }

    pub async fn send<T: Serialize>(&mut self, value: &T) -> GraphResult<()> {
        self.writer.send(value).await
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> GraphResult<Option<T>> {
        self.reader.recv().await
    }

    pub async fn expect<T: DeserializeOwned>(&mut self) -> GraphResult<T> {
        self.reader.expect().await
    }

    /// Send `request` and wait for exactly one reply frame
    pub async fn round_trip<Req: Serialize, Rep: DeserializeOwned>(&mut self, request: &Req) -> GraphResult<Rep> {
        self.send(request).await?;
        self.expect().await
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio::net::TcpListener;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u32,
        label: String,
    }

    async fn pair() -> (FramedConnection, FramedConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let endpoint = Endpoint::new("127.0.0.1", addr.port());
        let (client, accepted) = tokio::join!(
            FramedConnection::connect(&endpoint, Duration::from_secs(1)),
            listener.accept()
        );
        (client.unwrap(), FramedConnection::new(accepted.unwrap().0))
    }

    #[test]
    fn test_frame_prefix_matches_body_length() {
        let frame = encode_frame(&Sample { id: 7, label: "x".into() }).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (mut client, mut server) = pair().await;
        for id in 0..5 {
            client.send(&Sample { id, label: format!("m{}", id) }).await.unwrap();
        }
        for id in 0..5 {
            let got: Sample = server.expect().await.unwrap();
            assert_eq!(got.id, id);
        }
    }

    #[tokio::test]
    async fn test_clean_close_reads_as_none() {
        let (client, mut server) = pair().await;
        let (_, writer) = client.into_split();
        writer.close().await;
        let next: Option<Sample> = server.recv().await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_oversized_announcement_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut raw = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let mut server = FramedConnection::new(accepted);

        raw.write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes()).await.unwrap();
        let result: GraphResult<Option<Sample>> = server.recv().await;
        assert!(matches!(result, Err(GraphError::Codec(_))));
    }
}
