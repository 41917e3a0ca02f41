use std::io::Read;
use std::sync::Arc;

use crc::{CRC_64_XZ, Crc};
use md5::{Digest as _, Md5};

use crate::errors::{Result, UpdaterError};

// Same ECMA polynomial the storage providers expose as crc64ecma.
static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Incremental digest fed block by block while a stream is in flight.
pub trait StreamChecksum: Send {
    fn update(&mut self, bytes: &[u8]);
    fn finish(self: Box<Self>) -> String;
}

/// Whole-stream and incremental checksum calculation.
///
/// Digests are opaque algorithm-specific strings; compare them only with
/// [`checksums_equal`], and only against digests produced by the same
/// compression + checksum algorithm pair.
pub trait ChecksumProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn streaming(&self) -> Box<dyn StreamChecksum>;

    /// Digest an entire reader without buffering it.
    fn calculate(&self, reader: &mut dyn Read) -> std::io::Result<String> {
        let mut digest = self.streaming();
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digest.update(&buf[..n]);
        }
        Ok(digest.finish())
    }

    fn calculate_bytes(&self, bytes: &[u8]) -> String {
        let mut digest = self.streaming();
        digest.update(bytes);
        digest.finish()
    }
}

/// Digest strings carry no numeric semantics and are compared
/// case-insensitively.
#[must_use]
pub fn checksums_equal(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Resolve a manifest/config algorithm name to a provider, once per session.
pub fn resolve(name: &str) -> Result<Arc<dyn ChecksumProvider>> {
    match name {
        "crc64" => Ok(Arc::new(Crc64Provider)),
        "md5" => Ok(Arc::new(Md5Provider)),
        other => Err(UpdaterError::Config(format!(
            "no effective checksum provider for {other:?}"
        ))),
    }
}

/// CRC-64 rendered as the decimal string used by provider-native checks.
pub struct Crc64Provider;

struct Crc64Stream {
    digest: crc::Digest<'static, u64>,
}

impl StreamChecksum for Crc64Stream {
    fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
    }

    fn finish(self: Box<Self>) -> String {
        self.digest.finalize().to_string()
    }
}

impl ChecksumProvider for Crc64Provider {
    fn name(&self) -> &'static str {
        "crc64"
    }

    fn streaming(&self) -> Box<dyn StreamChecksum> {
        Box::new(Crc64Stream {
            digest: CRC64.digest(),
        })
    }
}

/// MD5 rendered as lowercase hex, for backends with MD5-based metadata.
pub struct Md5Provider;

struct Md5Stream {
    hasher: Md5,
}

impl StreamChecksum for Md5Stream {
    fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    fn finish(self: Box<Self>) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl ChecksumProvider for Md5Provider {
    fn name(&self) -> &'static str {
        "md5"
    }

    fn streaming(&self) -> Box<dyn StreamChecksum> {
        Box::new(Md5Stream { hasher: Md5::new() })
    }
}
