//! Length-prefixed frame codec for snapshot streams.
//!
//! A snapshot stream is a concatenation of frames, one message per frame:
//! a u32 big-endian payload length followed by the message's RFC 5424
//! encoding. The same format serves the replication wire and on-disk
//! snapshot files, so a file can be replayed through the same scanner a
//! follower uses.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::message::{Message, ParseError};

/// Upper bound on a single snapshot frame.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot stream error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot frame is not a valid syslog message: {0}")]
    Parse(#[from] ParseError),
}

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_type::<u32>()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Writes every message of every buffer as one frame, in the order given.
/// Returns on the first write error.
pub async fn write_to<W>(buffers: &[Vec<Arc<Message>>], writer: W) -> Result<(), SnapshotError>
where
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedWrite::new(writer, frame_codec());
    for buffer in buffers {
        for message in buffer {
            frames.feed(message.encoded()).await?;
        }
    }
    frames.flush().await?;
    Ok(())
}

/// Writes the buffered prefix, then one frame per message received on
/// `tail` until the channel closes or a write fails. On a write failure the
/// caller must drain `tail` so the replicator side never stalls.
pub async fn stream_to<W>(
    buffers: &[Vec<Arc<Message>>],
    tail: &mut mpsc::Receiver<Arc<Message>>,
    writer: W,
) -> Result<(), SnapshotError>
where
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedWrite::new(writer, frame_codec());
    for buffer in buffers {
        for message in buffer {
            frames.feed(message.encoded()).await?;
        }
    }
    frames.flush().await?;

    while let Some(message) = tail.recv().await {
        frames.send(message.encoded()).await?;
    }
    Ok(())
}

/// Lazy decoder for a snapshot stream.
pub struct SnapshotScanner<R> {
    frames: FramedRead<R, LengthDelimitedCodec>,
}

impl<R> SnapshotScanner<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> SnapshotScanner<R> {
        SnapshotScanner {
            frames: FramedRead::new(reader, frame_codec()),
        }
    }

    /// The next message on the stream, `None` on clean end of stream. A
    /// truncated frame or an unparseable payload is an error.
    pub async fn next_message(&mut self) -> Result<Option<Message>, SnapshotError> {
        match self.frames.next().await {
            None => Ok(None),
            Some(frame) => Ok(Some(Message::parse(frame?.freeze())?)),
        }
    }
}
