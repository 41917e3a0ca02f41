use std::io::{self, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::write::{GzDecoder, GzEncoder};

const BROTLI_BUFFER: usize = 4096;
const BROTLI_QUALITY: u32 = 9;
const BROTLI_LGWIN: u32 = 22;

/// One-direction incremental transform: feed blocks, then collect the output.
pub trait StreamTransform: Send {
    fn process_block(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn finish(self: Box<Self>) -> io::Result<Vec<u8>>;
}

/// Whole-buffer and incremental compress/decompress.
///
/// The algorithm is an explicit manifest field, never negotiated; both sides
/// resolve the same name through [`resolve`].
pub trait CompressionProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn compressor(&self) -> Box<dyn StreamTransform>;
    fn decompressor(&self) -> Box<dyn StreamTransform>;

    fn compress(&self, src: &[u8]) -> io::Result<Vec<u8>> {
        let mut transform = self.compressor();
        transform.process_block(src)?;
        transform.finish()
    }

    fn decompress(&self, src: &[u8]) -> io::Result<Vec<u8>> {
        let mut transform = self.decompressor();
        transform.process_block(src)?;
        transform.finish()
    }
}

/// Resolve an algorithm name; unrecognised names (including the explicit
/// `"raw"`) fall back to the identity transform.
pub fn resolve(name: &str) -> Arc<dyn CompressionProvider> {
    match name {
        "brotli" => Arc::new(BrotliProvider),
        "gzip" => Arc::new(GzipProvider),
        _ => Arc::new(RawProvider),
    }
}

/// Identity transform for payloads not worth compressing.
pub struct RawProvider;

struct Passthrough(Vec<u8>);

impl StreamTransform for Passthrough {
    fn process_block(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0.extend_from_slice(bytes);
        Ok(())
    }

    fn finish(self: Box<Self>) -> io::Result<Vec<u8>> {
        Ok(self.0)
    }
}

impl CompressionProvider for RawProvider {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn compressor(&self) -> Box<dyn StreamTransform> {
        Box::new(Passthrough(Vec::new()))
    }

    fn decompressor(&self) -> Box<dyn StreamTransform> {
        Box::new(Passthrough(Vec::new()))
    }
}

pub struct GzipProvider;

struct GzipCompress(GzEncoder<Vec<u8>>);

impl StreamTransform for GzipCompress {
    fn process_block(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0.write_all(bytes)
    }

    fn finish(self: Box<Self>) -> io::Result<Vec<u8>> {
        self.0.finish()
    }
}

struct GzipDecompress(GzDecoder<Vec<u8>>);

impl StreamTransform for GzipDecompress {
    fn process_block(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0.write_all(bytes)
    }

    fn finish(self: Box<Self>) -> io::Result<Vec<u8>> {
        self.0.finish()
    }
}

impl CompressionProvider for GzipProvider {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compressor(&self) -> Box<dyn StreamTransform> {
        Box::new(GzipCompress(GzEncoder::new(
            Vec::new(),
            Compression::default(),
        )))
    }

    fn decompressor(&self) -> Box<dyn StreamTransform> {
        Box::new(GzipDecompress(GzDecoder::new(Vec::new())))
    }
}

pub struct BrotliProvider;

struct BrotliCompress(brotli::CompressorWriter<Vec<u8>>);

impl StreamTransform for BrotliCompress {
    fn process_block(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0.write_all(bytes)
    }

    fn finish(self: Box<Self>) -> io::Result<Vec<u8>> {
        let mut writer = self.0;
        writer.flush()?;
        Ok(writer.into_inner())
    }
}

struct BrotliDecompress(brotli::DecompressorWriter<Vec<u8>>);

impl StreamTransform for BrotliDecompress {
    fn process_block(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0.write_all(bytes)
    }

    fn finish(self: Box<Self>) -> io::Result<Vec<u8>> {
        let mut writer = self.0;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|_| io::Error::other("truncated brotli stream"))
    }
}

impl CompressionProvider for BrotliProvider {
    fn name(&self) -> &'static str {
        "brotli"
    }

    fn compressor(&self) -> Box<dyn StreamTransform> {
        Box::new(BrotliCompress(brotli::CompressorWriter::new(
            Vec::new(),
            BROTLI_BUFFER,
            BROTLI_QUALITY,
            BROTLI_LGWIN,
        )))
    }

    fn decompressor(&self) -> Box<dyn StreamTransform> {
        Box::new(BrotliDecompress(brotli::DecompressorWriter::new(
            Vec::new(),
            BROTLI_BUFFER,
        )))
    }

    fn compress(&self, src: &[u8]) -> io::Result<Vec<u8>> {
        let mut params = brotli::enc::BrotliEncoderParams::default();
        params.quality = BROTLI_QUALITY as i32;
        params.lgwin = BROTLI_LGWIN as i32;
        let mut out = Vec::new();
        brotli::BrotliCompress(&mut &src[..], &mut out, &params)?;
        Ok(out)
    }

    fn decompress(&self, src: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        brotli::BrotliDecompress(&mut &src[..], &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_is_identity() {
        let provider = RawProvider;
        let data = b"unchanged bytes".to_vec();
        assert_eq!(provider.compress(&data).unwrap(), data);
        assert_eq!(provider.decompress(&data).unwrap(), data);
    }

    #[test]
    fn gzip_round_trips() {
        let provider = GzipProvider;
        let data = b"gzip me ".repeat(200);
        let compressed = provider.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(provider.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn brotli_round_trips() {
        let provider = BrotliProvider;
        let data = b"brotli me ".repeat(200);
        let compressed = provider.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(provider.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn incremental_decompress_matches_whole_buffer() {
        let provider = GzipProvider;
        let data = b"chunked transfer ".repeat(100);
        let compressed = provider.compress(&data).unwrap();

        let mut transform = provider.decompressor();
        for chunk in compressed.chunks(7) {
            transform.process_block(chunk).unwrap();
        }
        assert_eq!(transform.finish().unwrap(), data);
    }

    #[test]
    fn unknown_names_fall_back_to_raw() {
        assert_eq!(resolve("zstd").name(), "raw");
        assert_eq!(resolve("").name(), "raw");
        assert_eq!(resolve("brotli").name(), "brotli");
        assert_eq!(resolve("gzip").name(), "gzip");
    }
}
