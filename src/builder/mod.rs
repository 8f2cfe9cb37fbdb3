//! Output building: committed transactions become framed, serialized
//! messages on the writer queue.

pub mod json;
pub mod queue;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::memory::{MemoryArena, SwapSpace};
use crate::redo::lob::{LobAssembler, LobLocator};
use crate::redo::numeric::decode_number;
use crate::redo::record::{decode_columns, ChangeRecord, RowOp};
use crate::schema::{ColumnType, SchemaCache, SchemaDelta, TableDef};
use crate::transaction::TransactionReplay;
use crate::types::{Scn, Seq};
use crate::{Error, Result};

pub use json::{
    ColumnFormat, FormatOptions, JsonFormatter, MessageFormatter, MsgHeader, Side, UnknownFormat,
    UnknownType,
};
pub use queue::{
    builder_queue, BuilderConsumer, BuilderProducer, BuilderQueue, MessageMeta, OutputMessage,
    MSG_FLAG_CHECKPOINT,
};

use json::{ATTR_BEGIN, ATTR_COMMIT, ATTR_DML, CHAR_HEX, CHAR_NOMAPPING, DB_ADD_DDL, DB_ADD_DML};

/// Turns replayed change records into serialized messages.
///
/// Owned by the parser task; produces into the writer queue during
/// commit replay, so commits surface downstream in replay order.
pub struct Builder {
    formatter: JsonFormatter,
    producer: BuilderProducer,
    schema: Arc<SchemaCache>,
    db_name: String,
    lwn_scn: Scn,
    lwn_msg_idx: u64,
    msg_id: u64,
}

impl Builder {
    pub fn new(
        formatter: JsonFormatter,
        producer: BuilderProducer,
        schema: Arc<SchemaCache>,
        db_name: String,
    ) -> Self {
        Builder {
            formatter,
            producer,
            schema,
            db_name,
            lwn_scn: Scn::ZERO,
            lwn_msg_idx: 0,
            msg_id: 0,
        }
    }

    /// Called at each LWN boundary; `c_scn`/`c_idx` restart here, which
    /// is what keeps them stable across restarts.
    pub fn set_lwn(&mut self, scn: Scn) {
        self.lwn_scn = scn;
        self.lwn_msg_idx = 0;
    }

    /// Wakes the writer regardless of the flush threshold.
    pub fn flush(&self) {
        self.producer.flush();
    }

    /// Replays one committed transaction into the output queue.
    pub async fn process_transaction(
        &mut self,
        replay: &mut TransactionReplay,
        lob: &LobAssembler,
        arena: &MemoryArena,
        swap: &SwapSpace,
        sequence: Seq,
    ) -> Result<()> {
        let (xid, commit_scn, commit_time, offset, attributes) = {
            let tx = replay.transaction();
            (tx.xid, tx.commit_scn, tx.commit_time_us, tx.start_offset, tx.attributes.clone())
        };
        let options = self.formatter.options().clone();
        let full = options.msg_full();

        let attrs_for = |bit: u32| -> Option<&std::collections::HashMap<String, String>> {
            (options.attributes & bit != 0).then_some(&attributes)
        };

        if full {
            self.formatter.begin_msg();
            let header = MsgHeader {
                db_name: (options.db & DB_ADD_DML != 0).then_some(self.db_name.as_str()),
                scn: commit_scn,
                commit_time_us: commit_time,
                c_scn: self.lwn_scn,
                c_idx: self.lwn_msg_idx,
                xid,
                sequence,
                offset,
                attributes: attrs_for(ATTR_DML),
            };
            self.formatter.write_header(&header);
        } else if !options.skip_begin() {
            self.publish_control("begin", xid, commit_scn, commit_time, sequence, offset, attrs_for(ATTR_BEGIN), 0)
                .await?;
        }

        let mut first_obj = 0;
        while let Some(record) = replay.next(arena, swap).await? {
            if first_obj == 0 {
                first_obj = record.obj;
            }
            if record.op == RowOp::Ddl {
                if full {
                    // DDL inside a full-message transaction stays a
                    // payload element of its own.
                    self.formatter.begin_row("ddl", None, None, Some(record.scn), None);
                    self.formatter.end_row();
                } else {
                    self.emit_ddl(&record, xid, commit_scn, commit_time, sequence, offset).await?;
                }
                continue;
            }
            let Some(table) = self.schema.resolve(record.obj, xid) else {
                debug!(obj = record.obj, "no table definition, row skipped");
                continue;
            };

            if full {
                self.emit_row_into_message(&record, &table, lob, commit_time)?;
            } else {
                self.formatter.begin_msg();
                let header = MsgHeader {
                    db_name: (options.db & DB_ADD_DML != 0).then_some(self.db_name.as_str()),
                    scn: commit_scn,
                    commit_time_us: commit_time,
                    c_scn: self.lwn_scn,
                    c_idx: self.lwn_msg_idx,
                    xid,
                    sequence,
                    offset,
                    attributes: attrs_for(ATTR_DML),
                };
                self.formatter.write_header(&header);
                self.emit_row_into_message(&record, &table, lob, commit_time)?;
                let payload = self.formatter.end_msg();
                let tag = table.tag.clone();
                self.publish(commit_scn, sequence, record.obj, 0, tag.as_deref(), &payload).await?;
            }
        }

        if full {
            let payload = self.formatter.end_msg();
            self.publish(commit_scn, sequence, first_obj, 0, None, &payload).await?;
        } else if !options.skip_commit() {
            self.publish_control("commit", xid, commit_scn, commit_time, sequence, offset, attrs_for(ATTR_COMMIT), 0)
                .await?;
        }

        self.producer.flush();
        Ok(())
    }

    /// Emits the schema-change event carried by a DDL record. The cache
    /// merge has already happened at commit; this is the outward-facing
    /// notification.
    async fn emit_ddl(
        &mut self,
        record: &ChangeRecord,
        xid: crate::types::Xid,
        commit_scn: Scn,
        commit_time: i64,
        sequence: Seq,
        offset: u64,
    ) -> Result<()> {
        let delta = match &record.after {
            Some(payload) => SchemaDelta::decode(payload)?,
            None => SchemaDelta::default(),
        };
        let table = self.schema.resolve(record.obj, xid);

        let options = self.formatter.options().clone();
        self.formatter.begin_msg();
        let header = MsgHeader {
            db_name: (options.db & DB_ADD_DDL != 0).then_some(self.db_name.as_str()),
            scn: commit_scn,
            commit_time_us: commit_time,
            c_scn: self.lwn_scn,
            c_idx: self.lwn_msg_idx,
            xid,
            sequence,
            offset,
            attributes: None,
        };
        self.formatter.write_header(&header);
        self.formatter.begin_row("ddl", table.as_ref(), None, Some(record.scn), None);
        if let Some(sql) = &delta.ddl_text {
            self.formatter
                .write_column(Side::After, "sql", &format!("\"{}\"", json::escape_json(sql)));
        }
        self.formatter.end_row();
        let payload = self.formatter.end_msg();
        self.publish(commit_scn, sequence, record.obj, 0, None, &payload).await
    }

    /// Emits a checkpoint-flagged message so the writer can advance the
    /// confirmation fence while the stream is idle.
    pub async fn process_checkpoint(&mut self, scn: Scn, sequence: Seq) -> Result<()> {
        self.formatter.begin_msg();
        let header = MsgHeader {
            db_name: None,
            scn,
            commit_time_us: 0,
            c_scn: self.lwn_scn,
            c_idx: self.lwn_msg_idx,
            xid: crate::types::Xid::default(),
            sequence,
            offset: 0,
            attributes: None,
        };
        self.formatter.write_header(&header);
        self.formatter.begin_row("chkpt", None, None, None, None);
        self.formatter.end_row();
        let payload = self.formatter.end_msg();
        self.publish(scn, sequence, 0, MSG_FLAG_CHECKPOINT, None, &payload).await?;
        self.producer.flush();
        Ok(())
    }

    async fn publish_control(
        &mut self,
        op: &str,
        xid: crate::types::Xid,
        scn: Scn,
        commit_time: i64,
        sequence: Seq,
        offset: u64,
        attributes: Option<&std::collections::HashMap<String, String>>,
        flags: u16,
    ) -> Result<()> {
        let options = self.formatter.options().clone();
        self.formatter.begin_msg();
        let header = MsgHeader {
            db_name: (options.db & DB_ADD_DML != 0).then_some(self.db_name.as_str()),
            scn,
            commit_time_us: commit_time,
            c_scn: self.lwn_scn,
            c_idx: self.lwn_msg_idx,
            xid,
            sequence,
            offset,
            attributes,
        };
        self.formatter.write_header(&header);
        self.formatter.begin_row(op, None, None, None, None);
        self.formatter.end_row();
        let payload = self.formatter.end_msg();
        self.publish(scn, sequence, 0, flags, None, &payload).await
    }

    async fn publish(
        &mut self,
        scn: Scn,
        sequence: Seq,
        obj: u32,
        flags: u16,
        tag: Option<&str>,
        payload: &[u8],
    ) -> Result<()> {
        let meta = MessageMeta {
            id: self.msg_id,
            scn,
            c_scn: self.lwn_scn,
            c_idx: self.lwn_msg_idx,
            sequence,
            obj,
            flags,
        };
        self.msg_id += 1;
        self.lwn_msg_idx += 1;
        self.producer.publish(&meta, tag.map(|t| t.as_bytes()), payload).await
    }

    /// Writes one row element into the open message.
    fn emit_row_into_message(
        &mut self,
        record: &ChangeRecord,
        table: &TableDef,
        lob: &LobAssembler,
        commit_time: i64,
    ) -> Result<()> {
        let options = self.formatter.options().clone();
        let op = match record.op {
            RowOp::Insert => "c",
            RowOp::Update => "u",
            RowOp::Delete => "d",
            RowOp::Ddl => "ddl",
        };
        let rid = crate::types::RowId::new(record.data_obj, record.dba, record.slot).to_text();

        let before = match &record.before {
            Some(buf) => column_map(buf.clone())?,
            None => BTreeMap::new(),
        };
        let after = match &record.after {
            Some(buf) => column_map(buf.clone())?,
            None => BTreeMap::new(),
        };

        self.formatter.begin_row(op, Some(table), Some(rid), Some(record.scn), Some(commit_time));

        match record.op {
            RowOp::Insert => {
                self.emit_side(Side::After, &after, table, lob, &options, options.column != ColumnFormat::Changed)?;
            }
            RowOp::Delete => {
                self.emit_side(Side::Before, &before, table, lob, &options, options.column != ColumnFormat::Changed)?;
            }
            RowOp::Update => {
                let keep: Vec<u16> = match options.column {
                    ColumnFormat::FullUpd => {
                        before.keys().chain(after.keys()).copied().collect()
                    }
                    _ => before
                        .keys()
                        .chain(after.keys())
                        .copied()
                        .filter(|num| {
                            let changed = before.get(num) != after.get(num);
                            let is_key = table.column(*num).map(|c| c.is_key).unwrap_or(false);
                            changed || is_key
                        })
                        .collect(),
                };
                let filtered =
                    |map: &BTreeMap<u16, Option<Bytes>>| -> BTreeMap<u16, Option<Bytes>> {
                        map.iter()
                            .filter(|(num, _)| keep.contains(num))
                            .map(|(num, value)| (*num, value.clone()))
                            .collect()
                    };
                self.emit_side(Side::Before, &filtered(&before), table, lob, &options, true)?;
                self.emit_side(Side::After, &filtered(&after), table, lob, &options, true)?;
            }
            RowOp::Ddl => {}
        }

        self.formatter.end_row();
        Ok(())
    }

    fn emit_side(
        &mut self,
        side: Side,
        columns: &BTreeMap<u16, Option<Bytes>>,
        table: &TableDef,
        lob: &LobAssembler,
        options: &FormatOptions,
        include_nulls: bool,
    ) -> Result<()> {
        for (num, value) in columns {
            let name = table.column_name(*num);
            let col_type = table.column_type(*num);
            match value {
                None => {
                    // Null columns of an unknown type stay hidden unless
                    // configured otherwise.
                    if col_type == ColumnType::Unknown && options.unknown_type == UnknownType::Hide {
                        continue;
                    }
                    if !include_nulls {
                        continue;
                    }
                    self.formatter.write_column(side, &name, "null");
                }
                Some(bytes) => {
                    match render_value(col_type, bytes, options, lob) {
                        Ok(Some(rendered)) => self.formatter.write_column(side, &name, &rendered),
                        Ok(None) => {}
                        Err(e) if !e.is_fatal() => {
                            warn!(column = %name, "value dropped: {e}");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }
}

fn column_map(buf: Bytes) -> Result<BTreeMap<u16, Option<Bytes>>> {
    let mut buf = buf;
    let columns = decode_columns(&mut buf)?;
    Ok(columns.into_iter().map(|c| (c.column, c.value)).collect())
}

/// Renders one column value as a raw JSON fragment.
///
/// `Ok(None)` means the value is suppressed (hidden unknown type or an
/// unresolved LOB, which has already been warned about).
pub fn render_value(
    col_type: ColumnType,
    bytes: &Bytes,
    options: &FormatOptions,
    lob: &LobAssembler,
) -> Result<Option<String>> {
    let rendered = match col_type {
        ColumnType::Number => decode_number(bytes)?,
        ColumnType::Char => format!("\"{}\"", render_chars(bytes, options)),
        ColumnType::Date | ColumnType::Timestamp => {
            let micros = read_i64(bytes)?;
            match json::format_timestamp(micros, options.timestamp) {
                json::TimestampText::Number(n) => n,
                json::TimestampText::Text(s) => format!("\"{s}\""),
            }
        }
        ColumnType::TimestampTz => {
            if bytes.len() < 10 {
                return Err(Error::redo(60003, "timestamp-tz value truncated"));
            }
            let micros = read_i64(bytes)?;
            let offset_min =
                i16::from_le_bytes([bytes[8], bytes[9]]);
            render_timestamp_tz(micros, offset_min, options.timestamp_tz)
        }
        ColumnType::Float => {
            if bytes.len() < 4 {
                return Err(Error::redo(60003, "float value truncated"));
            }
            let value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            format_float(value as f64)
        }
        ColumnType::Double => {
            let bits = read_i64(bytes)? as u64;
            format_float(f64::from_bits(bits))
        }
        ColumnType::Raw => format!("\"{}\"", hex_string(bytes)),
        ColumnType::Rowid => {
            if bytes.len() < 10 {
                return Err(Error::redo(60003, "rowid value truncated"));
            }
            let data_obj = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let dba = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            let slot = u16::from_le_bytes([bytes[8], bytes[9]]);
            format!("\"{}\"", crate::types::RowId::new(data_obj, dba, slot).to_text())
        }
        ColumnType::IntervalDts => {
            let nanos = read_i64(bytes)?;
            render_interval_dts(nanos, options.interval_dts)
        }
        ColumnType::IntervalYtm => {
            if bytes.len() < 4 {
                return Err(Error::redo(60003, "interval value truncated"));
            }
            let months = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            render_interval_ytm(months, options.interval_ytm)
        }
        ColumnType::Clob | ColumnType::Blob => {
            let locator = LobLocator::decode(bytes.clone())?;
            match lob.materialize(&locator) {
                Ok(Some(value)) => {
                    let data = value.to_bytes();
                    if col_type == ColumnType::Clob {
                        format!("\"{}\"", render_chars(&data, options))
                    } else {
                        format!("\"{}\"", hex_string(&data))
                    }
                }
                Ok(None) => {
                    warn!(lob = %locator.lob_id, "lob unresolved at replay, value dropped");
                    return Ok(None);
                }
                Err(e) if !e.is_fatal() => {
                    warn!("lob value dropped: {e}");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
        ColumnType::Unknown => {
            if options.unknown_type == UnknownType::Hide {
                return Ok(None);
            }
            format!("\"{}\"", hex_string(bytes))
        }
    };
    Ok(Some(rendered))
}

/// Applies the character policy: hex dump, no mapping, or UTF-8 with the
/// unknown-byte policy.
fn render_chars(bytes: &[u8], options: &FormatOptions) -> String {
    if options.char_format & CHAR_HEX != 0 {
        return hex_string(bytes);
    }
    if options.char_format & CHAR_NOMAPPING != 0 {
        return json::escape_json(&bytes.iter().map(|&b| b as char).collect::<String>());
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => json::escape_json(text),
        Err(_) => match options.unknown {
            UnknownFormat::QuestionMark => {
                let text: String = String::from_utf8_lossy(bytes).replace('\u{FFFD}', "?");
                json::escape_json(&text)
            }
            UnknownFormat::Dump => hex_string(bytes),
        },
    }
}

fn render_timestamp_tz(micros: i64, offset_min: i16, format: u32) -> String {
    use chrono::FixedOffset;
    // 0-3: unix strings at nano..second resolution; 4-11: ISO-8601.
    match format {
        0 => format!("\"{}\"", micros.saturating_mul(1000)),
        1 => format!("\"{micros}\""),
        2 => format!("\"{}\"", micros / 1000),
        3 => format!("\"{}\"", micros / 1_000_000),
        _ => {
            let precision = match format {
                4 | 8 => chrono::SecondsFormat::Nanos,
                5 | 9 => chrono::SecondsFormat::Micros,
                6 | 10 => chrono::SecondsFormat::Millis,
                _ => chrono::SecondsFormat::Secs,
            };
            let datetime = chrono::DateTime::from_timestamp_micros(micros).unwrap_or_default();
            let text = match FixedOffset::east_opt(offset_min as i32 * 60) {
                Some(offset) => datetime.with_timezone(&offset).to_rfc3339_opts(precision, false),
                None => datetime.to_rfc3339_opts(precision, false),
            };
            format!("\"{text}\"")
        }
    }
}

/// Day-to-second interval: 0-3 unix-unit numbers, 4-7 the same quoted,
/// 8-10 `D HH:MM:SS.fffffffff` text with space, comma, or dash.
fn render_interval_dts(nanos: i64, format: u32) -> String {
    match format {
        0 => nanos.to_string(),
        1 => (nanos / 1_000).to_string(),
        2 => (nanos / 1_000_000).to_string(),
        3 => (nanos / 1_000_000_000).to_string(),
        4 => format!("\"{nanos}\""),
        5 => format!("\"{}\"", nanos / 1_000),
        6 => format!("\"{}\"", nanos / 1_000_000),
        7 => format!("\"{}\"", nanos / 1_000_000_000),
        _ => {
            let separator = match format {
                8 => " ",
                9 => ",",
                _ => "-",
            };
            let negative = nanos < 0;
            let abs = nanos.unsigned_abs();
            let days = abs / 86_400_000_000_000;
            let rem = abs % 86_400_000_000_000;
            let hours = rem / 3_600_000_000_000;
            let rem = rem % 3_600_000_000_000;
            let minutes = rem / 60_000_000_000;
            let rem = rem % 60_000_000_000;
            let seconds = rem / 1_000_000_000;
            let frac = rem % 1_000_000_000;
            format!(
                "\"{}{days}{separator}{hours:02}:{minutes:02}:{seconds:02}.{frac:09}\"",
                if negative { "-" } else { "" }
            )
        }
    }
}

/// Year-to-month interval: months number, months string, or `Y-M` text.
fn render_interval_ytm(months: i32, format: u32) -> String {
    match format {
        0 => months.to_string(),
        1 => format!("\"{months}\""),
        _ => {
            let separator = match format {
                2 => " ",
                3 => ",",
                _ => "-",
            };
            let negative = months < 0;
            let abs = months.unsigned_abs();
            format!(
                "\"{}{}{separator}{}\"",
                if negative { "-" } else { "" },
                abs / 12,
                abs % 12
            )
        }
    }
}

fn format_float(value: f64) -> String {
    if value.is_finite() {
        value.to_string()
    } else {
        // JSON has no NaN/Infinity.
        "null".to_string()
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn read_i64(bytes: &Bytes) -> Result<i64> {
    if bytes.len() < 8 {
        return Err(Error::redo(60003, "numeric payload truncated"));
    }
    Ok(i64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FormatConfig;

    fn options() -> FormatOptions {
        FormatOptions::from_config(&FormatConfig::default())
    }

    #[test]
    fn renders_numbers_bare() {
        let lob = LobAssembler::new();
        let value = render_value(
            ColumnType::Number,
            &Bytes::from_static(&[0xC2, 0x02, 0x18]),
            &options(),
            &lob,
        )
        .unwrap()
        .unwrap();
        assert_eq!(value, "123");
    }

    #[test]
    fn renders_chars_quoted_and_escaped() {
        let lob = LobAssembler::new();
        let value = render_value(
            ColumnType::Char,
            &Bytes::from_static(b"a\"b"),
            &options(),
            &lob,
        )
        .unwrap()
        .unwrap();
        assert_eq!(value, "\"a\\\"b\"");
    }

    #[test]
    fn invalid_utf8_uses_question_marks() {
        let lob = LobAssembler::new();
        let value = render_value(
            ColumnType::Char,
            &Bytes::from_static(&[b'a', 0xFF, b'b']),
            &options(),
            &lob,
        )
        .unwrap()
        .unwrap();
        assert_eq!(value, "\"a?b\"");
    }

    #[test]
    fn invalid_utf8_hex_dump_mode() {
        let lob = LobAssembler::new();
        let mut config = FormatConfig::default();
        config.unknown = 1;
        let value = render_value(
            ColumnType::Char,
            &Bytes::from_static(&[0xFF]),
            &FormatOptions::from_config(&config),
            &lob,
        )
        .unwrap()
        .unwrap();
        assert_eq!(value, "\"ff\"");
    }

    #[test]
    fn unknown_type_hidden_by_default() {
        let lob = LobAssembler::new();
        let value = render_value(ColumnType::Unknown, &Bytes::from_static(b"x"), &options(), &lob).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn renders_intervals() {
        assert_eq!(render_interval_ytm(25, 0), "25");
        assert_eq!(render_interval_ytm(25, 2), "\"2 1\"");
        assert_eq!(render_interval_ytm(-13, 4), "\"-1-1\"");
        assert_eq!(render_interval_dts(90_061_000_000_123, 8), "\"1 01:01:01.000000123\"");
        assert_eq!(render_interval_dts(5_000_000_000, 3), "5");
    }

    #[test]
    fn renders_doubles() {
        let lob = LobAssembler::new();
        let bits = 2.5f64.to_bits().to_le_bytes();
        let value = render_value(
            ColumnType::Double,
            &Bytes::copy_from_slice(&bits),
            &options(),
            &lob,
        )
        .unwrap()
        .unwrap();
        assert_eq!(value, "2.5");
    }
}
