//! Binary format of the persisted dex use log
//!
//! Layout:
//! - Header: magic (4 bytes) + version (u32) + SHA-256 of the payload (32 bytes)
//! - Payload: length-prefixed (u32, little-endian) lists mirroring the registry maps.
//!   Strings are a u32 byte length followed by UTF-8.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

use super::model::{
    DexLoader, DexUse, PackageDexUse, PrimaryDexUse, PrimaryDexUseRecord, SecondaryDexUse,
    SecondaryDexUseRecord,
};

/// Magic number of dex use logs: "DXUS"
pub const MAGIC: [u8; 4] = *b"DXUS";

/// Current format version
pub const VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 32;

/// Errors that can occur while reading or writing the log
#[derive(Debug, Error)]
pub enum CodecError {
    /// Reading or writing the file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not a dex use log
    #[error("Invalid magic number: expected DXUS, got {0:?}")]
    BadMagic([u8; 4]),

    /// Written by an incompatible version
    #[error("Unsupported version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// The data ends early
    #[error("Unexpected end of data at offset {0}")]
    Truncated(usize),

    /// The payload does not match its checksum
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// A string is not valid UTF-8
    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    /// A length prefix exceeds the remaining data
    #[error("Length prefix too large at offset {0}")]
    Oversized(usize),
}

struct LogWriter {
    buffer: Vec<u8>,
}

impl LogWriter {
    fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_len(&mut self, len: usize) {
        self.emit_u32(len as u32);
    }

    fn emit_str(&mut self, value: &str) {
        self.emit_len(value.len());
        self.buffer.extend_from_slice(value.as_bytes());
    }

    fn emit_loader(&mut self, loader: &DexLoader) {
        self.emit_str(&loader.loading_package_name);
        self.emit_u8(loader.isolated_process as u8);
    }
}

struct LogReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> LogReader<'a> {
    fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::Truncated(self.position));
        }
        let bytes = &self.buffer[self.position..self.position + len];
        self.position += len;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.read_bytes(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn read_i64(&mut self) -> Result<i64, CodecError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.read_bytes(8)?);
        Ok(i64::from_le_bytes(raw))
    }

    /// A count of items that each take at least `min_item_len` bytes
    fn read_count(&mut self, min_item_len: usize) -> Result<usize, CodecError> {
        let offset = self.position;
        let count = self.read_u32()? as usize;
        if count.saturating_mul(min_item_len) > self.remaining() {
            return Err(CodecError::Oversized(offset));
        }
        Ok(count)
    }

    fn read_string(&mut self) -> Result<String, CodecError> {
        let offset = self.position;
        let len = self.read_count(1)?;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8(offset))
    }

    fn read_loader(&mut self) -> Result<DexLoader, CodecError> {
        let loading_package_name = self.read_string()?;
        let isolated_process = self.read_u8()? != 0;
        Ok(DexLoader {
            loading_package_name,
            isolated_process,
        })
    }
}

/// Serialize the registry
pub fn encode(dex_use: &DexUse) -> Vec<u8> {
    let mut writer = LogWriter::new();
    writer.emit_len(dex_use.packages.len());
    for (owner, pkg) in &dex_use.packages {
        writer.emit_str(owner);

        writer.emit_len(pkg.primary.len());
        for (dex_path, primary) in &pkg.primary {
            writer.emit_str(dex_path);
            writer.emit_len(primary.records.len());
            for (loader, record) in &primary.records {
                writer.emit_loader(loader);
                writer.emit_i64(record.last_used_at_ms);
            }
        }

        writer.emit_len(pkg.secondary.len());
        for (dex_path, secondary) in &pkg.secondary {
            writer.emit_str(dex_path);
            writer.emit_u32(secondary.user_id);
            writer.emit_len(secondary.records.len());
            for (loader, record) in &secondary.records {
                writer.emit_loader(loader);
                writer.emit_str(&record.class_loader_context);
                writer.emit_str(&record.abi_name);
                writer.emit_i64(record.last_used_at_ms);
            }
        }
    }

    let payload = writer.buffer;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&Sha256::digest(&payload));
    out.extend_from_slice(&payload);
    out
}

/// Parse a registry written by [`encode`]. Contents are not validated here.
pub fn decode(data: &[u8]) -> Result<DexUse, CodecError> {
    let mut reader = LogReader::new(data);

    let mut magic = [0u8; 4];
    magic.copy_from_slice(reader.read_bytes(4)?);
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let version = reader.read_u32()?;
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let checksum = reader.read_bytes(32)?;
    let payload = &data[HEADER_LEN..];
    if Sha256::digest(payload).as_slice() != checksum {
        return Err(CodecError::ChecksumMismatch);
    }

    let mut dex_use = DexUse::default();
    let package_count = reader.read_count(12)?;
    for _ in 0..package_count {
        let owner = reader.read_string()?;
        let mut pkg = PackageDexUse::default();

        let primary_count = reader.read_count(8)?;
        for _ in 0..primary_count {
            let dex_path = reader.read_string()?;
            let mut primary = PrimaryDexUse::default();
            let record_count = reader.read_count(13)?;
            for _ in 0..record_count {
                let loader = reader.read_loader()?;
                let last_used_at_ms = reader.read_i64()?;
                primary
                    .records
                    .insert(loader, PrimaryDexUseRecord { last_used_at_ms });
            }
            pkg.primary.insert(dex_path, primary);
        }

        let secondary_count = reader.read_count(12)?;
        for _ in 0..secondary_count {
            let dex_path = reader.read_string()?;
            let user_id = reader.read_u32()?;
            let mut records = BTreeMap::new();
            let record_count = reader.read_count(21)?;
            for _ in 0..record_count {
                let loader = reader.read_loader()?;
                let class_loader_context = reader.read_string()?;
                let abi_name = reader.read_string()?;
                let last_used_at_ms = reader.read_i64()?;
                records.insert(
                    loader,
                    SecondaryDexUseRecord {
                        class_loader_context,
                        abi_name,
                        last_used_at_ms,
                    },
                );
            }
            pkg.secondary
                .insert(dex_path, SecondaryDexUse { user_id, records });
        }

        dex_use.packages.insert(owner, pkg);
    }

    if reader.remaining() != 0 {
        return Err(CodecError::Oversized(reader.position));
    }
    Ok(dex_use)
}
