use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Interleaved frames open with `$`, per RFC 2326 §10.12.
const FRAME_MARKER: u8 = b'$';

/// Bytes scanned for a frame marker before the stream is declared
/// desynchronised.
const MAX_RESYNC_BYTES: usize = 64 * 1024;

/// Reads `$ <channel> <len:u16-be> <payload>` records off the stream.
///
/// Sole owner of the read cursor once PLAY has completed. Every read is a
/// full read: a frame is either delivered whole or the truncation
/// surfaces as a read error.
pub struct InterleavedReader<R> {
    stream: R,
}

impl<R> InterleavedReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(stream: R) -> Self {
        Self { stream }
    }

    /// Returns the next `(channel, payload)` record.
    ///
    /// Non-marker bytes in front of a frame are skipped, up to the resync
    /// budget.
    pub async fn next_frame(&mut self) -> Result<(u8, Vec<u8>)> {
        let mut skipped = 0usize;
        let mut byte = [0u8; 1];
        loop {
            self.stream.read_exact(&mut byte).await?;
            if byte[0] == FRAME_MARKER {
                break;
            }
            skipped += 1;
            if skipped >= MAX_RESYNC_BYTES {
                return Err(Error::Desync { skipped });
            }
        }
        if skipped > 0 {
            debug!("skipped {} bytes before a frame marker", skipped);
        }

        let mut header = [0u8; 3];
        self.stream.read_exact(&mut header).await?;
        let channel = header[0];
        let length = u16::from_be_bytes([header[1], header[2]]) as usize;

        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload).await?;
        trace!("interleaved frame: channel={}, length={}", channel, length);

        Ok((channel, payload))
    }

    pub fn into_inner(self) -> R {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn reads_consecutive_frames() {
        let data = vec![
            b'$', 0, 0, 4, // channel 0, length 4
            1, 2, 3, 4, //
            b'$', 1, 0, 3, // channel 1, length 3
            5, 6, 7,
        ];
        let mut reader = InterleavedReader::new(Cursor::new(data));

        let (channel, payload) = reader.next_frame().await.unwrap();
        assert_eq!(channel, 0);
        assert_eq!(payload, vec![1, 2, 3, 4]);

        let (channel, payload) = reader.next_frame().await.unwrap();
        assert_eq!(channel, 1);
        assert_eq!(payload, vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn skips_junk_in_front_of_a_frame() {
        let data = vec![0xDE, 0xAD, 0xBE, b'$', 2, 0, 1, 0x99];
        let mut reader = InterleavedReader::new(Cursor::new(data));

        let (channel, payload) = reader.next_frame().await.unwrap();

        assert_eq!(channel, 2);
        assert_eq!(payload, vec![0x99]);
    }

    #[tokio::test]
    async fn handles_zero_length_payload() {
        let data = vec![b'$', 0, 0, 0];
        let mut reader = InterleavedReader::new(Cursor::new(data));

        let (channel, payload) = reader.next_frame().await.unwrap();

        assert_eq!(channel, 0);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn truncated_payload_is_a_read_error() {
        let data = vec![b'$', 0, 0, 10, 1, 2, 3];
        let mut reader = InterleavedReader::new(Cursor::new(data));

        assert!(matches!(reader.next_frame().await, Err(Error::Read(_))));
    }

    #[tokio::test]
    async fn truncated_header_is_a_read_error() {
        let data = vec![b'$', 0];
        let mut reader = InterleavedReader::new(Cursor::new(data));

        assert!(matches!(reader.next_frame().await, Err(Error::Read(_))));
    }

    #[tokio::test]
    async fn end_of_stream_is_a_read_error() {
        let mut reader = InterleavedReader::new(Cursor::new(Vec::new()));

        assert!(matches!(reader.next_frame().await, Err(Error::Read(_))));
    }

    #[tokio::test]
    async fn unbroken_junk_exhausts_the_resync_budget() {
        let mut reader = InterleavedReader::new(Cursor::new(vec![0xAA; MAX_RESYNC_BYTES + 8]));

        assert!(matches!(
            reader.next_frame().await,
            Err(Error::Desync { skipped: MAX_RESYNC_BYTES })
        ));
    }
}
