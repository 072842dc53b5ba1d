//! Frame extraction over a live chunked byte stream.
//!
//! A [`FrameExtractor`] owns one [`FrameBuffer`], decodes every payload it
//! cuts out on the blocking pool and publishes the newest decoded frame.
//! Consumers always see the latest frame only; there is no queue.

use crate::decoder::{DecodedFrame, FrameDecoder, JpegDecoder};
use crate::frame::FrameBuffer;
use bytes::Bytes;
use closecircuit_core::blocking::{run_blocking_cancellable, BlockingError};
use closecircuit_core::config::StreamConfig;
use closecircuit_core::Observable;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Why [`FrameExtractor::run`] returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The byte source ran out
    Finished,
    /// The cancellation token fired
    Cancelled,
    /// The byte source reported an error
    ReadError(String),
}

pub struct FrameExtractor<D: FrameDecoder = JpegDecoder> {
    buffer: FrameBuffer,
    decoder: Arc<D>,
    latest: Observable<Option<DecodedFrame>>,
    sequence: u64,
}

impl FrameExtractor<JpegDecoder> {
    /// Extractor using the default JPEG decoder
    pub fn new(config: &StreamConfig) -> Self {
        Self::with_decoder(config, JpegDecoder)
    }
}

impl<D: FrameDecoder> FrameExtractor<D> {
    pub fn with_decoder(config: &StreamConfig, decoder: D) -> Self {
        // Frames are numbered, so comparing sequence numbers is enough
        let latest = Observable::with_equality(None, |a: &Option<DecodedFrame>, b: &Option<DecodedFrame>| {
            a.as_ref().map(|f| f.sequence) == b.as_ref().map(|f| f.sequence)
        });

        Self {
            buffer: FrameBuffer::new(config.max_buffer_bytes),
            decoder: Arc::new(decoder),
            latest,
            sequence: 0,
        }
    }

    /// Receiver holding the newest decoded frame
    pub fn subscribe(&self) -> watch::Receiver<Option<DecodedFrame>> {
        self.latest.subscribe()
    }

    pub fn latest(&self) -> Option<DecodedFrame> {
        self.latest.get()
    }

    /// Bytes waiting for the next frame boundary
    pub fn buffered(&self) -> &[u8] {
        self.buffer.as_bytes()
    }

    /// Feeds one chunk. Returns the newest frame it completed, if it decoded.
    ///
    /// Undecodable payloads are dropped. The only error is cancellation
    /// while a decode is in flight.
    pub async fn push_chunk(
        &mut self,
        chunk: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<DecodedFrame>, BlockingError> {
        let Some(payload) = self.buffer.push(chunk) else {
            return Ok(None);
        };

        let size = payload.len();
        let decoder = Arc::clone(&self.decoder);
        let decoded = run_blocking_cancellable(cancel, move |_| decoder.decode(&payload)).await;

        match decoded {
            Ok(Ok(image)) => {
                self.sequence += 1;
                let frame = DecodedFrame::new(self.sequence, image);
                trace!(
                    sequence = frame.sequence,
                    width = frame.width,
                    height = frame.height,
                    bytes = size,
                    "Frame decoded"
                );
                self.latest.publish(Some(frame.clone()));
                Ok(Some(frame))
            }
            Ok(Err(e)) => {
                debug!(error = %e, bytes = size, "Discarding undecodable frame");
                Ok(None)
            }
            Err(BlockingError::Panicked) => {
                warn!(bytes = size, "Frame decoder panicked, discarding frame");
                Ok(None)
            }
            Err(BlockingError::Cancelled) => Err(BlockingError::Cancelled),
        }
    }

    /// Drives the extractor until the stream ends, fails or is cancelled.
    ///
    /// Ending is silent; the caller decides whether to reconnect.
    pub async fn run<S, E>(&mut self, stream: S, cancel: &CancellationToken) -> StreamEnd
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        futures::pin_mut!(stream);

        loop {
            let next = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Frame extraction cancelled");
                    return StreamEnd::Cancelled;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    if self.push_chunk(&chunk, cancel).await.is_err() {
                        debug!("Frame extraction cancelled during decode");
                        return StreamEnd::Cancelled;
                    }
                }
                Some(Err(e)) => {
                    debug!(error = %e, "Stream read failed");
                    return StreamEnd::ReadError(e.to_string());
                }
                None => {
                    debug!(frames = self.sequence, "Stream finished");
                    return StreamEnd::Finished;
                }
            }
        }
    }
}
