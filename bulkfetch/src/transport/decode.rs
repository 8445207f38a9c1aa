//! Streaming content decoding.
//!
//! The transport hands out raw bytes exactly as they travelled the wire;
//! the file task feeds them through a [`BodyDecoder`] so both the raw and
//! the decoded byte counts stay observable for statistics. Gzip and
//! deflate come from `flate2`, brotli from the `brotli` crate.

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;

/// Body encodings the engine can undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    #[default]
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

impl ContentEncoding {
    /// Map a `Content-Encoding` header value. Unknown encodings are treated
    /// as identity; the digest check will catch an actual mismatch.
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("gzip") | Some("x-gzip") => ContentEncoding::Gzip,
            Some("deflate") => ContentEncoding::Deflate,
            Some("br") => ContentEncoding::Brotli,
            _ => ContentEncoding::Identity,
        }
    }

    pub fn is_identity(self) -> bool {
        self == ContentEncoding::Identity
    }
}

/// Shared append-only sink the decompressors write into; the decoder
/// drains it after every chunk.
#[derive(Clone, Default)]
struct DrainBuf(Arc<Mutex<Vec<u8>>>);

impl DrainBuf {
    fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl Write for DrainBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Decoder {
    Identity,
    Gzip(flate2::write::GzDecoder<DrainBuf>, DrainBuf),
    Deflate(flate2::write::ZlibDecoder<DrainBuf>, DrainBuf),
    Brotli(Box<brotli::DecompressorWriter<DrainBuf>>, DrainBuf),
}

/// Incremental body decoder.
///
/// Feed raw chunks with [`write`](Self::write), collect decoded output per
/// chunk, then call [`finish`](Self::finish) for the tail the decompressor
/// was still holding.
pub struct BodyDecoder {
    inner: Decoder,
}

impl BodyDecoder {
    pub fn new(encoding: ContentEncoding) -> Self {
        let inner = match encoding {
            ContentEncoding::Identity => Decoder::Identity,
            ContentEncoding::Gzip => {
                let sink = DrainBuf::default();
                Decoder::Gzip(flate2::write::GzDecoder::new(sink.clone()), sink)
            }
            ContentEncoding::Deflate => {
                let sink = DrainBuf::default();
                Decoder::Deflate(flate2::write::ZlibDecoder::new(sink.clone()), sink)
            }
            ContentEncoding::Brotli => {
                let sink = DrainBuf::default();
                Decoder::Brotli(
                    Box::new(brotli::DecompressorWriter::new(sink.clone(), 4096)),
                    sink,
                )
            }
        };
        Self { inner }
    }

    /// Push one raw chunk and get whatever decoded bytes became available.
    pub fn write(&mut self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        match &mut self.inner {
            Decoder::Identity => Ok(chunk.to_vec()),
            Decoder::Gzip(decoder, sink) => {
                decoder.write_all(chunk)?;
                decoder.flush()?;
                Ok(sink.drain())
            }
            Decoder::Deflate(decoder, sink) => {
                decoder.write_all(chunk)?;
                decoder.flush()?;
                Ok(sink.drain())
            }
            Decoder::Brotli(decoder, sink) => {
                decoder.write_all(chunk)?;
                decoder.flush()?;
                Ok(sink.drain())
            }
        }
    }

    /// Close the stream and return any remaining decoded bytes. An
    /// incomplete compressed stream surfaces as an error here.
    pub fn finish(self) -> io::Result<Vec<u8>> {
        match self.inner {
            Decoder::Identity => Ok(Vec::new()),
            Decoder::Gzip(decoder, sink) => {
                decoder.finish()?;
                Ok(sink.drain())
            }
            Decoder::Deflate(decoder, sink) => {
                decoder.finish()?;
                Ok(sink.drain())
            }
            Decoder::Brotli(decoder, sink) => {
                // The brotli writer flushes its tail when dropped.
                drop(decoder);
                Ok(sink.drain())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn brotli_bytes(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut enc = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            enc.write_all(data).unwrap();
        }
        out
    }

    fn decode_all(encoding: ContentEncoding, raw: &[u8], chunk_size: usize) -> Vec<u8> {
        let mut decoder = BodyDecoder::new(encoding);
        let mut out = Vec::new();
        for chunk in raw.chunks(chunk_size) {
            out.extend(decoder.write(chunk).unwrap());
        }
        out.extend(decoder.finish().unwrap());
        out
    }

    #[test]
    fn header_mapping() {
        assert_eq!(ContentEncoding::from_header(None), ContentEncoding::Identity);
        assert_eq!(ContentEncoding::from_header(Some("gzip")), ContentEncoding::Gzip);
        assert_eq!(ContentEncoding::from_header(Some("x-gzip")), ContentEncoding::Gzip);
        assert_eq!(ContentEncoding::from_header(Some("BR")), ContentEncoding::Brotli);
        assert_eq!(ContentEncoding::from_header(Some("deflate")), ContentEncoding::Deflate);
        assert_eq!(
            ContentEncoding::from_header(Some("zstd")),
            ContentEncoding::Identity
        );
    }

    #[test]
    fn identity_passes_through() {
        let data = b"raw bytes as-is";
        assert_eq!(decode_all(ContentEncoding::Identity, data, 4), data);
    }

    #[test]
    fn gzip_round_trip_in_small_chunks() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let encoded = gzip(&data);
        assert_eq!(decode_all(ContentEncoding::Gzip, &encoded, 7), data);
    }

    #[test]
    fn deflate_round_trip() {
        let data = b"the same phrase repeated, the same phrase repeated";
        let encoded = zlib(data);
        assert_eq!(decode_all(ContentEncoding::Deflate, &encoded, 16), data);
    }

    #[test]
    fn brotli_round_trip() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 13) as u8).collect();
        let encoded = brotli_bytes(&data);
        assert_eq!(decode_all(ContentEncoding::Brotli, &encoded, 64), data);
    }

    #[test]
    fn truncated_gzip_fails_on_finish() {
        let encoded = gzip(b"some payload worth compressing, some payload");
        let truncated = &encoded[..encoded.len() / 2];

        let mut decoder = BodyDecoder::new(ContentEncoding::Gzip);
        let _ = decoder.write(truncated);
        assert!(decoder.finish().is_err());
    }
}
