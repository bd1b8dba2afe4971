//! Streaming blob verification and unpacking
//!
//! Layer blobs are served gzipped. While the body streams in, two digests
//! are computed at once: the digest of the compressed bytes (checked against
//! the manifest's `blobSum`) and the digest of the decompressed tar payload
//! (the `DiffID` feeding the rootfs chain). The decompressed bytes go to the
//! destination sink as they are produced, so nothing is buffered in full.

use crate::digest::{Digest, Digester};
use crate::error::{PullError, Result};
use flate2::write::GzDecoder;
use std::io::{self, Write};

/// Outcome of a completed blob download
#[derive(Debug)]
pub struct BlobSummary {
    /// Digest of the uncompressed tar payload
    pub diff_id: Digest,
    /// Decompressed size in bytes
    pub uncompressed_len: u64,
}

struct TeeWriter<W: Write> {
    inner: W,
    digester: Digester,
    written: u64,
}

impl<W: Write> Write for TeeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digester.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A `Write` sink that verifies and unpacks one gzipped layer blob.
///
/// Feed it the compressed bytes as they arrive, then call
/// [`BlobUnpacker::finish`] with the expected blob sum.
pub struct BlobUnpacker<W: Write> {
    compressed_digester: Digester,
    decoder: GzDecoder<TeeWriter<W>>,
}

impl<W: Write> BlobUnpacker<W> {
    pub fn new(sink: W) -> Self {
        Self {
            compressed_digester: Digester::new(),
            decoder: GzDecoder::new(TeeWriter {
                inner: sink,
                digester: Digester::new(),
                written: 0,
            }),
        }
    }

    /// Complete the gzip stream and verify the compressed digest against
    /// the manifest's blob sum.
    pub fn finish(self, expected_blob_sum: &Digest) -> Result<BlobSummary> {
        let mut tee = self
            .decoder
            .finish()
            .map_err(|e| PullError::Io(format!("Failed to decompress layer: {}", e)))?;
        tee.flush()?;

        let computed = self.compressed_digester.finalize();
        if &computed != expected_blob_sum {
            return Err(PullError::Integrity {
                expected: expected_blob_sum.to_string(),
                computed: computed.to_string(),
            });
        }

        Ok(BlobSummary {
            diff_id: tee.digester.finalize(),
            uncompressed_len: tee.written,
        })
    }
}

impl<W: Write> Write for BlobUnpacker<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.decoder.write(buf)?;
        self.compressed_digester.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.decoder.flush()
    }
}
