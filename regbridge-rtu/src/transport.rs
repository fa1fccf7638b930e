//! Frame-level access to the serial line.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::SerialStream;
use tracing::debug;

use crate::config::SerialConfig;
use crate::frame::MAX_FRAME_LEN;

/// Errors raised by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial open failed: {0}")]
    Open(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transport closed")]
    Closed,
}

/// Byte-oriented, half-duplex frame transport.
pub trait Transport: Send {
    /// Wait up to `timeout` for the next complete frame.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    fn receive_frame(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    /// Transmit one frame.
    fn send_frame(&mut self, frame: &[u8])
    -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// RTU framing over any byte stream.
///
/// A frame ends when the line stays silent for the inter-frame gap.
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
    inter_frame_gap: Duration,
}

impl<S> StreamTransport<S> {
    pub fn new(stream: S, inter_frame_gap: Duration) -> Self {
        Self {
            stream,
            inter_frame_gap,
        }
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn receive_frame(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let mut chunk = [0u8; MAX_FRAME_LEN];

        let n = match tokio::time::timeout(timeout, self.stream.read(&mut chunk)).await {
            Err(_) => return Ok(None),
            Ok(read) => read?,
        };
        if n == 0 {
            return Err(TransportError::Closed);
        }

        let mut frame = chunk[..n].to_vec();
        loop {
            match tokio::time::timeout(self.inter_frame_gap, self.stream.read(&mut chunk)).await {
                Err(_) | Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    frame.extend_from_slice(&chunk[..n]);
                    if frame.len() > MAX_FRAME_LEN {
                        debug!(len = frame.len(), "Oversized frame, cutting short");
                        break;
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        Ok(Some(frame))
    }

    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Transport over a local serial port.
pub type SerialTransport = StreamTransport<SerialStream>;

/// Open the configured serial port.
pub fn open_serial(config: &SerialConfig) -> Result<SerialTransport, TransportError> {
    let parity = match config.parity.to_lowercase().as_str() {
        "even" => tokio_serial::Parity::Even,
        "odd" => tokio_serial::Parity::Odd,
        _ => tokio_serial::Parity::None,
    };

    let stop_bits = match config.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };

    let data_bits = match config.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };

    let builder = tokio_serial::new(&config.port, config.baud_rate)
        .parity(parity)
        .stop_bits(stop_bits)
        .data_bits(data_bits);

    let serial = SerialStream::open(&builder)
        .map_err(|e| TransportError::Open(format!("{}: {}", config.port, e)))?;

    Ok(StreamTransport::new(serial, config.inter_frame_gap()))
}
