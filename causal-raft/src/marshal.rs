//! Low-level marshalling helpers shared by the wire codec, the log entry
//! content types and the durable state files.
//!
//! Every persisted or transmitted structure implements an explicit
//! `(marshal, unmarshal)` pair against `bytes` buffers; there is no
//! reflective serialization anywhere on the wire or on disk.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;

use crate::error::ProtocolViolation;
use crate::ClusterId;
use crate::MemberId;
use crate::StoreId;

/// Largest length-prefixed field accepted by the unmarshalling helpers.
/// A torn or hostile frame must not provoke a huge allocation.
pub const MAX_FIELD_LEN: usize = 16 * 1024 * 1024;

pub type MarshalResult<T> = Result<T, ProtocolViolation>;

/// Ensure `buf` holds at least `n` more bytes.
pub fn need(buf: &impl Buf, n: usize) -> MarshalResult<()> {
    if buf.remaining() < n {
        return Err(ProtocolViolation::Malformed("truncated message"));
    }
    Ok(())
}

pub fn put_member_id(buf: &mut impl BufMut, id: MemberId) {
    buf.put_u128(id.as_u128());
}

pub fn get_member_id(buf: &mut impl Buf) -> MarshalResult<MemberId> {
    need(buf, 16)?;
    Ok(MemberId::from_u128(buf.get_u128()))
}

pub fn put_cluster_id(buf: &mut impl BufMut, id: ClusterId) {
    buf.put_u128(id.as_u128());
}

pub fn get_cluster_id(buf: &mut impl Buf) -> MarshalResult<ClusterId> {
    need(buf, 16)?;
    Ok(ClusterId::from_u128(buf.get_u128()))
}

pub fn put_store_id(buf: &mut impl BufMut, id: StoreId) {
    buf.put_u128(id.as_u128());
}

pub fn get_store_id(buf: &mut impl Buf) -> MarshalResult<StoreId> {
    need(buf, 16)?;
    Ok(StoreId::from_u128(buf.get_u128()))
}

pub fn put_bool(buf: &mut impl BufMut, v: bool) {
    buf.put_u8(v as u8);
}

pub fn get_bool(buf: &mut impl Buf) -> MarshalResult<bool> {
    need(buf, 1)?;
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ProtocolViolation::Malformed("invalid boolean")),
    }
}

pub fn get_u8(buf: &mut impl Buf) -> MarshalResult<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut impl Buf) -> MarshalResult<u16> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn get_u32(buf: &mut impl Buf) -> MarshalResult<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn get_u64(buf: &mut impl Buf) -> MarshalResult<u64> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

/// Write a length-prefixed byte field.
pub fn put_bytes(buf: &mut impl BufMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Read a length-prefixed byte field.
pub fn get_bytes(buf: &mut impl Buf) -> MarshalResult<Bytes> {
    let len = get_u32(buf)? as usize;
    if len > MAX_FIELD_LEN {
        return Err(ProtocolViolation::OversizedFrame(len));
    }
    need(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

/// Write a length-prefixed UTF-8 string.
pub fn put_string(buf: &mut impl BufMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Read a length-prefixed UTF-8 string.
pub fn get_string(buf: &mut impl Buf) -> MarshalResult<String> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolViolation::Malformed("invalid utf-8"))
}
