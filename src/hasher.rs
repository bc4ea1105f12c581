use std::fmt;

use crc::{Crc, Digest, CRC_32_ISCSI, CRC_64_ECMA_182};

/// Checksum over whole chunk and table files.
static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Checksum over single log record payloads.
static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub fn record_checksum(payload: &[u8]) -> u32 {
    CRC32.checksum(payload)
}

/// Streaming CRC-64 over file contents written or validated piecewise.
#[derive(Clone)]
pub struct Hasher {
    digest: Digest<'static, u64>,
    len: u64,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hasher({} bytes)", self.len)
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            digest: CRC64.digest(),
            len: 0,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.digest.update(data);
        self.len += data.len() as u64;
    }

    /// Bytes fed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn checksum(&self) -> u64 {
        self.digest.clone().finalize()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}
