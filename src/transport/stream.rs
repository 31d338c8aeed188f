//! Length-delimited framing over byte streams

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use super::{FrameReader, FrameWriter};
use crate::error::{Error, Result};

/// Largest frame accepted off the wire
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// 4-byte big-endian length prefix, capped at `MAX_FRAME_LEN`
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

pub(super) fn framed<S>(
    io: S,
) -> (
    FramedRead<ReadHalf<S>, LengthDelimitedCodec>,
    FramedWrite<WriteHalf<S>, LengthDelimitedCodec>,
)
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(io);
    (
        FramedRead::new(read, frame_codec()),
        FramedWrite::new(write, frame_codec()),
    )
}

#[async_trait]
impl<R> FrameReader for FramedRead<R, LengthDelimitedCodec>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        match self.next().await {
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<W> FrameWriter for FramedWrite<W, LengthDelimitedCodec>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        SinkExt::<Bytes>::send(self, frame).await.map_err(Error::from)?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        SinkExt::<Bytes>::close(self).await.map_err(Error::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (_ra, mut wa) = framed(a);
        let (mut rb, _wb) = framed(b);

        // Writer enforces the same cap
        assert!(wa.write_frame(Bytes::from(vec![0u8; MAX_FRAME_LEN + 1])).await.is_err());

        wa.write_frame(Bytes::from(vec![1u8; MAX_FRAME_LEN])).await.unwrap();
        assert_eq!(rb.read_frame().await.unwrap().unwrap().len(), MAX_FRAME_LEN);
    }
}
