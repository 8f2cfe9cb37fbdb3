//! Fixtures for synthesizing redo log files.
//!
//! Used by unit and integration tests to build block-accurate log files
//! without a live database: change vectors are grouped into LWNs, LWNs
//! into block payloads, and blocks are written with real headers and
//! checksums so the whole pipeline runs against them.

use bytes::{BufMut, Bytes, BytesMut};

use crate::redo::block::{encode_block, BLOCK_HEADER_SIZE};
use crate::redo::parser::{encode_attributes, encode_commit_payload};
use crate::redo::record::{encode_columns, opcode, ChangeVector, ColumnValue};
use crate::types::{Scn, Seq, Xid};

/// Builds one LWN group from its member vectors.
pub fn encode_lwn(scn: u64, vectors: &[ChangeVector]) -> Bytes {
    let mut body = BytesMut::new();
    for vector in vectors {
        vector.encode(&mut body);
    }
    let mut out = BytesMut::with_capacity(16 + body.len());
    out.put_u64_le(scn);
    out.put_u32_le(vectors.len() as u32);
    out.put_u32_le(body.len() as u32);
    out.put_slice(&body);
    out.freeze()
}

/// Column list payload from `(column, value)` pairs.
pub fn columns(values: &[(u16, Option<&[u8]>)]) -> Bytes {
    let list: Vec<ColumnValue> = values
        .iter()
        .map(|(column, value)| ColumnValue {
            column: *column,
            value: value.map(Bytes::copy_from_slice),
        })
        .collect();
    let mut buf = BytesMut::new();
    encode_columns(&list, &mut buf);
    buf.freeze()
}

pub fn vector(op: u16, xid: Xid, scn: u64, obj: u32, dba: u32, slot: u16, payload: Bytes) -> ChangeVector {
    ChangeVector {
        opcode: op,
        fb: 0,
        xid,
        scn: Scn::new(scn),
        obj,
        data_obj: obj,
        dba,
        slot,
        payload,
    }
}

pub fn begin(xid: Xid, scn: u64) -> ChangeVector {
    vector(opcode::BEGIN, xid, scn, 0, 0, 0, Bytes::new())
}

pub fn insert(xid: Xid, scn: u64, obj: u32, dba: u32, slot: u16, values: &[(u16, Option<&[u8]>)]) -> ChangeVector {
    vector(opcode::INSERT_ROW, xid, scn, obj, dba, slot, columns(values))
}

pub fn delete(xid: Xid, scn: u64, obj: u32, dba: u32, slot: u16) -> ChangeVector {
    vector(opcode::DELETE_ROW, xid, scn, obj, dba, slot, columns(&[]))
}

pub fn update(xid: Xid, scn: u64, obj: u32, dba: u32, slot: u16, after: &[(u16, Option<&[u8]>)]) -> ChangeVector {
    vector(opcode::UPDATE_ROW, xid, scn, obj, dba, slot, columns(after))
}

pub fn undo(xid: Xid, scn: u64, obj: u32, dba: u32, slot: u16, before: &[(u16, Option<&[u8]>)]) -> ChangeVector {
    vector(opcode::UNDO, xid, scn, obj, dba, slot, columns(before))
}

pub fn commit(xid: Xid, scn: u64, timestamp_us: i64) -> ChangeVector {
    vector(opcode::COMMIT, xid, scn, 0, 0, 0, encode_commit_payload(false, timestamp_us))
}

pub fn rollback(xid: Xid, scn: u64) -> ChangeVector {
    vector(opcode::COMMIT, xid, scn, 0, 0, 0, encode_commit_payload(true, 0))
}

pub fn session_attributes(xid: Xid, scn: u64, attributes: &[(&str, &str)]) -> ChangeVector {
    let pairs: Vec<(String, String)> = attributes
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    vector(opcode::SESSION_ATTRS, xid, scn, 0, 0, 0, encode_attributes(&pairs))
}

/// Splits a part payload across continuation vectors with the given
/// flag byte.
pub fn row_part(op: u16, xid: Xid, scn: u64, obj: u32, dba: u32, slot: u16, fb: u8, part: &[u8]) -> ChangeVector {
    let mut v = vector(op, xid, scn, obj, dba, slot, Bytes::copy_from_slice(part));
    v.fb = fb;
    v
}

/// Accumulates LWN groups and writes them out as a block-formatted log
/// file.
pub struct LogFileBuilder {
    sequence: Seq,
    block_size: usize,
    payload: BytesMut,
}

impl LogFileBuilder {
    pub fn new(sequence: Seq, block_size: usize) -> Self {
        LogFileBuilder { sequence, block_size, payload: BytesMut::new() }
    }

    pub fn add_lwn(&mut self, scn: u64, vectors: &[ChangeVector]) -> &mut Self {
        self.payload.put_slice(&encode_lwn(scn, vectors));
        self
    }

    /// Serializes the accumulated payload into checksummed blocks.
    pub fn to_bytes(&self) -> Vec<u8> {
        let capacity = self.block_size - BLOCK_HEADER_SIZE;
        let chunks: Vec<&[u8]> = self.payload.chunks(capacity).collect();
        let total = chunks.len().max(1);
        let mut out = Vec::with_capacity(total * self.block_size);
        if chunks.is_empty() {
            out.extend_from_slice(&encode_block(self.sequence, 0, &[], true, self.block_size));
            return out;
        }
        for (i, chunk) in chunks.iter().enumerate() {
            let last = i == total - 1;
            out.extend_from_slice(&encode_block(self.sequence, i as u32, chunk, last, self.block_size));
        }
        out
    }

    pub fn write(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        std::fs::write(path, self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redo::block::BlockHeader;

    #[test]
    fn log_file_blocks_verify() {
        let xid = Xid::new(1, 1, 1);
        let mut builder = LogFileBuilder::new(1, 512);
        builder.add_lwn(
            1000,
            &[
                begin(xid, 1000),
                insert(xid, 1000, 101, 1, 0, &[(1, Some(b"A"))]),
                commit(xid, 1001, 0),
            ],
        );
        let bytes = builder.to_bytes();
        assert_eq!(bytes.len() % 512, 0);

        let header = BlockHeader::decode(&bytes).unwrap().unwrap();
        assert_eq!(header.sequence, 1);
        assert_eq!(header.block, 0);
        let payload = &bytes[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + header.payload_size as usize];
        assert!(header.verify(payload));
    }
}
