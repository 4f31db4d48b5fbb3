use std::{future::Future, net::SocketAddr};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tlm_core::{IngestError, Ingestor};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec, LinesCodec};
use tracing::{debug, info, warn};

mod error;

pub use error::Error;

/// Accepts newline-delimited or length-prefixed JSON events over TCP and
/// answers every frame with a JSON ack in the same framing.
#[derive(Deserialize, Debug, Clone)]
pub struct TcpCollector {
    pub id: String,
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default)]
    pub framing: Framing,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    #[default]
    Lines,
    // 4-byte big-endian length, then the frame
    LengthPrefixed,
}

pub fn default_address() -> String {
    "0.0.0.0:5170".to_string()
}

pub fn default_max_frame_bytes() -> usize {
    64 * 1024
}

#[derive(Serialize, Debug)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Ack {
    Accepted { id: u64 },
    Rejected { reason: &'static str, error: String },
}

impl From<Result<tlm_core::Receipt, IngestError>> for Ack {
    fn from(result: Result<tlm_core::Receipt, IngestError>) -> Self {
        match result {
            Ok(receipt) => Ack::Accepted { id: receipt.id },
            Err(e) => Ack::Rejected {
                reason: if e.is_overload() { "overloaded" } else { "parse" },
                error: e.to_string(),
            },
        }
    }
}

impl TcpCollector {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            framing: Framing::default(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_framing(&mut self, framing: Framing) -> &mut Self {
        self.framing = framing;
        self
    }

    pub fn set_max_frame_bytes(&mut self, max_frame_bytes: usize) -> &mut Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub async fn bind(&self) -> Result<TcpListener, Error> {
        let listener = TcpListener::bind(&self.address).await?;
        info!("{} listening on {}", self.id, listener.local_addr()?);
        Ok(listener)
    }

    /// Binds the configured address and serves until `shutdown` resolves.
    pub async fn run(
        &self,
        ingestor: Ingestor,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let listener = self.bind().await?;
        self.serve(listener, ingestor, shutdown).await
    }

    /// Accepts connections on `listener`, one task per connection, until
    /// `shutdown` resolves. Connections already open keep being served.
    pub async fn serve(
        &self,
        listener: TcpListener,
        ingestor: Ingestor,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("{} stops accepting connections", self.id);
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("{} failed to accept connection, {e}", self.id);
                            continue;
                        }
                    };
                    debug!("{} accepted connection from {peer}", self.id);
                    let id = self.id.clone();
                    let framing = self.framing;
                    let max_frame_bytes = self.max_frame_bytes;
                    let ingestor = ingestor.clone();
                    tokio::spawn(async move {
                        match handle_connection(stream, framing, max_frame_bytes, &ingestor).await {
                            Ok(()) => debug!("{id}: connection from {peer} closed"),
                            Err(e) => warn!("{id}: closing connection from {peer}, {e}"),
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    framing: Framing,
    max_frame_bytes: usize,
    ingestor: &Ingestor,
) -> Result<(), Error> {
    match framing {
        Framing::Lines => {
            let codec = LinesCodec::new_with_max_length(max_frame_bytes);
            serve_frames::<_, String>(Framed::new(stream, codec), ingestor, |ack| ack).await
        }
        Framing::LengthPrefixed => {
            let codec = LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(max_frame_bytes)
                .new_codec();
            serve_frames::<_, Bytes>(Framed::new(stream, codec), ingestor, Bytes::from).await
        }
    }
}

async fn serve_frames<C, I>(
    mut frames: Framed<TcpStream, C>,
    ingestor: &Ingestor,
    into_frame: fn(String) -> I,
) -> Result<(), Error>
where
    C: Decoder + Encoder<I> + Unpin,
    <C as Decoder>::Item: AsRef<[u8]>,
    Error: From<<C as Decoder>::Error> + From<<C as Encoder<I>>::Error>,
{
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        let ack = Ack::from(ingestor.submit(frame.as_ref()).await);
        frames.send(into_frame(serde_json::to_string(&ack)?)).await?;
    }
    Ok(())
}

/// Local address of a listener, handy when binding to port 0.
pub fn local_addr(listener: &TcpListener) -> Result<SocketAddr, Error> {
    Ok(listener.local_addr()?)
}
