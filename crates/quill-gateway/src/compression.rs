//! Transport compression
//!
//! `compress=zlib-stream` runs one zlib stream across the whole connection;
//! each WebSocket binary frame is a chunk ending in the zlib flush suffix.
//! The inflater keeps its dictionary between frames, so it must live as
//! long as the connection.

use flate2::{Decompress, FlushDecompress, Status};
use quill_common::{ClientError, ClientResult};

/// Marker suffix terminating each complete zlib-stream message
const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Stateful inflater for one gateway connection
pub struct Inflater {
    decompress: Decompress,
    buffer: Vec<u8>,
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

impl Inflater {
    #[must_use]
    pub fn new() -> Self {
        Self {
            decompress: Decompress::new(true),
            buffer: Vec::with_capacity(16 * 1024),
        }
    }

    /// Feed one WebSocket binary frame
    ///
    /// Returns the decompressed message once the frame completes one (ends
    /// with the flush suffix); `None` while a message is still split across
    /// frames.
    pub fn push(&mut self, frame: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        self.buffer.extend_from_slice(frame);
        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let mut out = Vec::with_capacity(self.buffer.len() * 4);
        let mut chunk = [0u8; 16 * 1024];
        let mut consumed = 0usize;
        loop {
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress(&self.buffer[consumed..], &mut chunk, FlushDecompress::Sync)
                .map_err(|e| ClientError::Protocol(format!("zlib-stream decode failed: {e}")))?;
            consumed += (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;
            out.extend_from_slice(&chunk[..produced]);

            if status == Status::StreamEnd {
                break;
            }
            // Finished once the input is drained and the output chunk was
            // not filled to the brim (a full chunk may hide pending output)
            if consumed >= self.buffer.len() && produced < chunk.len() {
                break;
            }
            if produced == 0 && consumed >= self.buffer.len() {
                break;
            }
        }

        self.buffer.clear();
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compress, Compression, FlushCompress};

    /// Compress messages onto one shared zlib stream, flushing after each
    struct TestDeflater(Compress);

    impl TestDeflater {
        fn new() -> Self {
            Self(Compress::new(Compression::default(), true))
        }

        fn push(&mut self, data: &[u8]) -> Vec<u8> {
            let mut out = vec![0u8; data.len() * 2 + 64];
            let before_out = self.0.total_out();
            let before_in = self.0.total_in();
            self.0
                .compress(data, &mut out, FlushCompress::Sync)
                .unwrap();
            assert_eq!((self.0.total_in() - before_in) as usize, data.len());
            out.truncate((self.0.total_out() - before_out) as usize);
            out
        }
    }

    #[test]
    fn test_single_message() {
        let mut deflater = TestDeflater::new();
        let mut inflater = Inflater::new();

        let frame = deflater.push(b"{\"op\":10}");
        assert!(frame.ends_with(&ZLIB_SUFFIX));
        let message = inflater.push(&frame).unwrap().unwrap();
        assert_eq!(message, b"{\"op\":10}");
    }

    #[test]
    fn test_stream_state_carries_across_messages() {
        let mut deflater = TestDeflater::new();
        let mut inflater = Inflater::new();

        for payload in [&b"{\"op\":10}"[..], b"{\"op\":11}", b"{\"op\":0,\"t\":\"READY\"}"] {
            let frame = deflater.push(payload);
            let message = inflater.push(&frame).unwrap().unwrap();
            assert_eq!(message, payload);
        }
    }

    #[test]
    fn test_partial_frame_buffers() {
        let mut deflater = TestDeflater::new();
        let mut inflater = Inflater::new();

        let frame = deflater.push(b"{\"op\":1,\"d\":42}");
        let (a, b) = frame.split_at(frame.len() / 2);
        assert!(inflater.push(a).unwrap().is_none());
        let message = inflater.push(b).unwrap().unwrap();
        assert_eq!(message, b"{\"op\":1,\"d\":42}");
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        let mut inflater = Inflater::new();
        let mut garbage = vec![0xAB; 32];
        garbage.extend_from_slice(&ZLIB_SUFFIX);
        assert!(inflater.push(&garbage).is_err());
    }
}
