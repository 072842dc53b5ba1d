//! Motion-JPEG frame extraction
//!
//! Cameras serve video as an endless `multipart/x-mixed-replace` body of JPEG
//! images. This crate ignores the multipart framing entirely and cuts frames
//! out by their JPEG start/end markers, which works for every MJPEG server
//! seen in the field regardless of boundary or header quirks.
//!
//! - [`FrameBuffer`]: marker scanning over an accumulating buffer, with an
//!   optional cap and resynchronization
//! - [`FrameDecoder`]: pluggable decoding; [`JpegDecoder`] uses the `image` crate
//! - [`FrameExtractor`]: drives a byte stream, decodes off the async scheduler
//!   and publishes the newest frame
//!
//! # Example
//!
//! ```no_run
//! use closecircuit_core::config::StreamConfig;
//! use closecircuit_mjpeg::FrameExtractor;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(stream: impl futures::Stream<Item = Result<bytes::Bytes, std::io::Error>>) {
//! let mut extractor = FrameExtractor::new(&StreamConfig::default());
//! let mut frames = extractor.subscribe();
//!
//! tokio::spawn(async move {
//!     while frames.changed().await.is_ok() {
//!         if let Some(frame) = frames.borrow_and_update().as_ref() {
//!             println!("frame {} ({}x{})", frame.sequence, frame.width, frame.height);
//!         }
//!     }
//! });
//!
//! let end = extractor.run(stream, &CancellationToken::new()).await;
//! println!("stream ended: {:?}", end);
//! # }
//! ```

pub mod decoder;
pub mod extractor;
pub mod frame;

pub use decoder::{DecodeError, DecodedFrame, FrameDecoder, JpegDecoder};
pub use extractor::{FrameExtractor, StreamEnd};
pub use frame::FrameBuffer;
