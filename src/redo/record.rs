//! Change vector model: the typed sub-records of the redo stream and the
//! fused change records stored in the transaction buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{DataObj, Dba, Obj, Scn, Xid};
use crate::{Error, Result};

/// Opcode vocabulary, `major << 8 | minor`.
pub mod opcode {
    /// Undo record carrying a prior row image.
    pub const UNDO: u16 = 0x0501;
    /// Transaction begin.
    pub const BEGIN: u16 = 0x0502;
    /// Transaction end; payload flag selects commit or rollback.
    pub const COMMIT: u16 = 0x0504;
    /// Session attributes attached to the transaction.
    pub const SESSION_ATTRS: u16 = 0x0514;
    /// Checkpoint marker flushed to the state keeper.
    pub const CHECKPOINT_MARK: u16 = 0x0701;
    pub const INSERT_ROW: u16 = 0x0B02;
    pub const DELETE_ROW: u16 = 0x0B03;
    pub const UPDATE_ROW: u16 = 0x0B05;
    pub const INSERT_ROWS: u16 = 0x0B0B;
    pub const DELETE_ROWS: u16 = 0x0B0C;
    pub const SUPPLEMENTAL: u16 = 0x0B10;
    /// LOB data page keyed by DBA.
    pub const LOB_DATA: u16 = 0x1301;
    /// LOB index entries mapping page ordinals to DBAs.
    pub const LOB_INDEX: u16 = 0x1501;
    /// Schema delta produced by DDL.
    pub const DDL: u16 = 0x1801;

    pub fn name(op: u16) -> &'static str {
        match op {
            UNDO => "undo",
            BEGIN => "begin",
            COMMIT => "commit",
            SESSION_ATTRS => "session-attributes",
            CHECKPOINT_MARK => "checkpoint",
            INSERT_ROW => "insert",
            DELETE_ROW => "delete",
            UPDATE_ROW => "update",
            INSERT_ROWS => "multi-insert",
            DELETE_ROWS => "multi-delete",
            SUPPLEMENTAL => "supplemental",
            LOB_DATA => "lob-data",
            LOB_INDEX => "lob-index",
            DDL => "ddl",
            _ => "unknown",
        }
    }
}

/// Multi-part row continuation flags: prior part exists / next part follows.
pub const FB_P: u8 = 0x01;
pub const FB_N: u8 = 0x02;

/// Fixed part of a change vector record on the wire, excluding the
/// leading `length` word.
pub const VECTOR_HEADER_SIZE: usize = 40;

/// One decoded redo sub-record. The payload stays opaque here; the
/// parser interprets it per opcode.
#[derive(Debug, Clone)]
pub struct ChangeVector {
    pub opcode: u16,
    pub fb: u8,
    pub xid: Xid,
    pub scn: Scn,
    pub obj: Obj,
    pub data_obj: DataObj,
    pub dba: Dba,
    pub slot: u16,
    pub payload: Bytes,
}

impl ChangeVector {
    /// Decodes one vector from `buf`, advancing past it.
    pub fn decode(buf: &mut Bytes) -> Result<ChangeVector> {
        if buf.remaining() < 4 {
            return Err(Error::redo(50009, "change vector truncated before length"));
        }
        let length = buf.get_u32_le() as usize;
        if length < VECTOR_HEADER_SIZE {
            return Err(Error::redo(50009, format!("change vector length too small: {length}")));
        }
        if buf.remaining() < length - 4 {
            return Err(Error::redo(
                50009,
                format!("change vector truncated: need {} bytes, have {}", length - 4, buf.remaining()),
            ));
        }

        let opcode = buf.get_u16_le();
        let fb = buf.get_u8();
        let _pad = buf.get_u8();
        let usn = buf.get_u16_le();
        let xid_slot = buf.get_u16_le();
        let xid_sequence = buf.get_u32_le();
        let obj = buf.get_u32_le();
        let data_obj = buf.get_u32_le();
        let dba = buf.get_u32_le();
        let slot = buf.get_u16_le();
        let _pad2 = buf.get_u16_le();
        let scn = Scn::new(buf.get_u64_le());

        let payload = buf.split_to(length - VECTOR_HEADER_SIZE);

        Ok(ChangeVector {
            opcode,
            fb,
            xid: Xid::new(usn, xid_slot, xid_sequence),
            scn,
            obj,
            data_obj,
            dba,
            slot,
            payload,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le((VECTOR_HEADER_SIZE + self.payload.len()) as u32);
        buf.put_u16_le(self.opcode);
        buf.put_u8(self.fb);
        buf.put_u8(0);
        buf.put_u16_le(self.xid.usn);
        buf.put_u16_le(self.xid.slot);
        buf.put_u32_le(self.xid.sequence);
        buf.put_u32_le(self.obj);
        buf.put_u32_le(self.data_obj);
        buf.put_u32_le(self.dba);
        buf.put_u16_le(self.slot);
        buf.put_u16_le(0);
        buf.put_u64_le(self.scn.as_u64());
        buf.put_slice(&self.payload);
    }

    pub fn wire_size(&self) -> usize {
        VECTOR_HEADER_SIZE + self.payload.len()
    }
}

/// One column of a row image. `None` is an explicit NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnValue {
    pub column: u16,
    pub value: Option<Bytes>,
}

const NULL_MARKER: u32 = 0xFFFF_FFFF;

/// Decodes a column list: `count u16`, then per column
/// `{column u16, size u32, bytes}` with `0xFFFFFFFF` marking NULL.
pub fn decode_columns(buf: &mut Bytes) -> Result<Vec<ColumnValue>> {
    if buf.remaining() < 2 {
        return Err(Error::redo(50010, "column list truncated"));
    }
    let count = buf.get_u16_le();
    let mut columns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if buf.remaining() < 6 {
            return Err(Error::redo(50010, "column entry truncated"));
        }
        let column = buf.get_u16_le();
        let size = buf.get_u32_le();
        if size == NULL_MARKER {
            columns.push(ColumnValue { column, value: None });
        } else {
            if buf.remaining() < size as usize {
                return Err(Error::redo(50010, format!("column {column} value truncated")));
            }
            columns.push(ColumnValue { column, value: Some(buf.split_to(size as usize)) });
        }
    }
    Ok(columns)
}

pub fn encode_columns(columns: &[ColumnValue], buf: &mut BytesMut) {
    buf.put_u16_le(columns.len() as u16);
    for col in columns {
        buf.put_u16_le(col.column);
        match &col.value {
            None => buf.put_u32_le(NULL_MARKER),
            Some(value) => {
                buf.put_u32_le(value.len() as u32);
                buf.put_slice(value);
            }
        }
    }
}

/// Row operation of a fused change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOp {
    Insert,
    Update,
    Delete,
    Ddl,
}

impl RowOp {
    fn as_u8(self) -> u8 {
        match self {
            RowOp::Insert => 0,
            RowOp::Update => 1,
            RowOp::Delete => 2,
            RowOp::Ddl => 3,
        }
    }

    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RowOp::Insert),
            1 => Ok(RowOp::Update),
            2 => Ok(RowOp::Delete),
            3 => Ok(RowOp::Ddl),
            other => Err(Error::redo(50010, format!("unknown row operation: {other}"))),
        }
    }
}

/// A fused row change as stored in transaction chunks: undo and redo
/// images already paired, multi-part rows already merged.
///
/// `before`/`after` hold encoded column lists; for DDL, `after` holds
/// the schema delta payload.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub op: RowOp,
    pub obj: Obj,
    pub data_obj: DataObj,
    pub dba: Dba,
    pub slot: u16,
    pub scn: Scn,
    pub before: Option<Bytes>,
    pub after: Option<Bytes>,
}

const RECORD_HEADER_SIZE: usize = 36;

impl ChangeRecord {
    /// Serialized size, used by the transaction buffer to pick a chunk.
    pub fn wire_size(&self) -> usize {
        RECORD_HEADER_SIZE
            + self.before.as_ref().map_or(0, |b| b.len())
            + self.after.as_ref().map_or(0, |a| a.len())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.wire_size() as u32);
        buf.put_u8(self.op.as_u8());
        buf.put_u8(0);
        buf.put_u16_le(self.slot);
        buf.put_u32_le(self.obj);
        buf.put_u32_le(self.data_obj);
        buf.put_u32_le(self.dba);
        buf.put_u64_le(self.scn.as_u64());
        match &self.before {
            None => buf.put_u32_le(NULL_MARKER),
            Some(b) => buf.put_u32_le(b.len() as u32),
        }
        match &self.after {
            None => buf.put_u32_le(NULL_MARKER),
            Some(a) => buf.put_u32_le(a.len() as u32),
        }
        if let Some(b) = &self.before {
            buf.put_slice(b);
        }
        if let Some(a) = &self.after {
            buf.put_slice(a);
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<ChangeRecord> {
        if buf.remaining() < 4 {
            return Err(Error::data(20005, "change record truncated before length"));
        }
        let length = buf.get_u32_le() as usize;
        if length < RECORD_HEADER_SIZE || buf.remaining() < length - 4 {
            return Err(Error::data(20005, format!("change record truncated: {length}")));
        }
        let op = RowOp::from_u8(buf.get_u8())?;
        let _pad = buf.get_u8();
        let slot = buf.get_u16_le();
        let obj = buf.get_u32_le();
        let data_obj = buf.get_u32_le();
        let dba = buf.get_u32_le();
        let scn = Scn::new(buf.get_u64_le());
        let before_len = buf.get_u32_le();
        let after_len = buf.get_u32_le();
        let before = if before_len == NULL_MARKER {
            None
        } else {
            Some(buf.split_to(before_len as usize))
        };
        let after = if after_len == NULL_MARKER {
            None
        } else {
            Some(buf.split_to(after_len as usize))
        };
        Ok(ChangeRecord { op, obj, data_obj, dba, slot, scn, before, after })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_roundtrip() {
        let vector = ChangeVector {
            opcode: opcode::INSERT_ROW,
            fb: 0,
            xid: Xid::new(1, 1, 1),
            scn: Scn::new(1000),
            obj: 101,
            data_obj: 101,
            dba: 0x0040_0001,
            slot: 0,
            payload: Bytes::from_static(b"payload"),
        };

        let mut buf = BytesMut::new();
        vector.encode(&mut buf);
        let mut bytes = buf.freeze();
        let decoded = ChangeVector::decode(&mut bytes).unwrap();

        assert_eq!(decoded.opcode, opcode::INSERT_ROW);
        assert_eq!(decoded.xid, Xid::new(1, 1, 1));
        assert_eq!(decoded.scn, Scn::new(1000));
        assert_eq!(&decoded.payload[..], b"payload");
        assert!(bytes.is_empty());
    }

    #[test]
    fn vector_truncation_is_redo_error() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(100);
        buf.put_u16_le(opcode::INSERT_ROW);
        let mut bytes = buf.freeze();
        let err = ChangeVector::decode(&mut bytes).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn column_list_roundtrip_with_null() {
        let columns = vec![
            ColumnValue { column: 1, value: Some(Bytes::from_static(b"A")) },
            ColumnValue { column: 2, value: None },
            ColumnValue { column: 3, value: Some(Bytes::from_static(&[0xC1, 0x02])) },
        ];
        let mut buf = BytesMut::new();
        encode_columns(&columns, &mut buf);
        let decoded = decode_columns(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, columns);
    }

    #[test]
    fn change_record_roundtrip() {
        let mut cols = BytesMut::new();
        encode_columns(
            &[ColumnValue { column: 1, value: Some(Bytes::from_static(b"x")) }],
            &mut cols,
        );
        let record = ChangeRecord {
            op: RowOp::Update,
            obj: 7,
            data_obj: 7,
            dba: 9,
            slot: 3,
            scn: Scn::new(555),
            before: Some(cols.clone().freeze()),
            after: Some(cols.freeze()),
        };

        let mut buf = BytesMut::new();
        record.encode(&mut buf);
        assert_eq!(buf.len(), record.wire_size());

        let decoded = ChangeRecord::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.op, RowOp::Update);
        assert_eq!(decoded.scn, Scn::new(555));
        assert_eq!(decoded.before, record.before);
        assert_eq!(decoded.after, record.after);
    }
}
