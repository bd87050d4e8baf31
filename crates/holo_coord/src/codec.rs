//! Big-endian buffer helpers shared by the wire codec and the on-disk formats.

use crc32fast::Hasher;

pub(crate) fn put_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub(crate) fn put_bool(buf: &mut Vec<u8>, value: bool) {
    buf.push(u8::from(value));
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Write a u32 length prefix followed by the raw bytes.
pub(crate) fn put_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    put_u32(buf, value.len() as u32);
    buf.extend_from_slice(value);
}

pub(crate) fn put_str(buf: &mut Vec<u8>, value: &str) {
    put_bytes(buf, value.as_bytes());
}

pub(crate) fn read_u8_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset < data.len(), "buffer short u8");
    let value = data[*offset];
    *offset += 1;
    Ok(value)
}

pub(crate) fn read_bool_at(data: &[u8], offset: &mut usize) -> anyhow::Result<bool> {
    match read_u8_at(data, offset)? {
        0 => Ok(false),
        1 => Ok(true),
        other => anyhow::bail!("invalid bool byte {other}"),
    }
}

/// Read a u32 from a buffer at the current offset.
pub(crate) fn read_u32_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "buffer short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

/// Read a u64 from a buffer at the current offset.
pub(crate) fn read_u64_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "buffer short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

/// Read a u32-length-prefixed byte string.
pub(crate) fn read_bytes_at(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<u8>> {
    let len = read_u32_at(data, offset)? as usize;
    anyhow::ensure!(*offset + len <= data.len(), "buffer short bytes");
    let value = data[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(value)
}

pub(crate) fn read_string_at(data: &[u8], offset: &mut usize) -> anyhow::Result<String> {
    let raw = read_bytes_at(data, offset)?;
    String::from_utf8(raw).map_err(|_| anyhow::anyhow!("string is not valid utf-8"))
}

pub(crate) fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
