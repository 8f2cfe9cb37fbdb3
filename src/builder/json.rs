//! JSON message formatting.
//!
//! The formatter exposes the fixed operation set `{begin_msg,
//! write_header, begin_row, write_column, end_row, end_msg}` behind the
//! [`MessageFormatter`] trait; serialization back-ends are selectable and
//! this is the JSON one. All format knobs from the `format` config
//! section are applied here.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::config::{
    FormatConfig, MSG_ADD_OFFSET, MSG_ADD_SEQUENCES, MSG_FULL, MSG_SKIP_BEGIN, MSG_SKIP_COMMIT,
    SCHEMA_FULL, SCHEMA_OBJ, SCHEMA_REPEATED, SCN_ALL_PAYLOADS, SCN_COMMIT_VALUE,
};
use crate::schema::TableDef;
use crate::types::{Scn, Seq, Xid};

/// `format.db` bits.
pub const DB_ADD_DML: u32 = 1 << 0;
pub const DB_ADD_DDL: u32 = 1 << 1;

/// `format.attributes` bits.
pub const ATTR_BEGIN: u32 = 1 << 0;
pub const ATTR_DML: u32 = 1 << 1;
pub const ATTR_COMMIT: u32 = 1 << 2;

/// `format.char` bits.
pub const CHAR_NOMAPPING: u32 = 1 << 0;
pub const CHAR_HEX: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RidFormat {
    Skip,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XidFormat {
    TextHex,
    TextDec,
    Numeric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScnFormat {
    Numeric,
    TextHex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownFormat {
    QuestionMark,
    Dump,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnFormat {
    /// Only changed columns for update, plus key columns.
    Changed,
    /// Also show nulls from insert and delete.
    FullInsDec,
    /// Everything the redo carries.
    FullUpd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownType {
    Hide,
    Show,
}

/// Typed view of the numeric `format` section.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub db: u32,
    pub attributes: u32,
    pub interval_dts: u32,
    pub interval_ytm: u32,
    pub message: u32,
    pub rid: RidFormat,
    pub xid: XidFormat,
    pub timestamp: u32,
    pub timestamp_tz: u32,
    pub timestamp_all: bool,
    pub char_format: u32,
    pub scn: ScnFormat,
    pub scn_type: u32,
    pub unknown: UnknownFormat,
    pub schema: u32,
    pub column: ColumnFormat,
    pub unknown_type: UnknownType,
    pub flush_buffer: u64,
}

impl FormatOptions {
    pub fn from_config(config: &FormatConfig) -> Self {
        FormatOptions {
            db: config.db,
            attributes: config.attributes,
            interval_dts: config.interval_dts,
            interval_ytm: config.interval_ytm,
            message: config.message,
            rid: if config.rid == 0 { RidFormat::Skip } else { RidFormat::Text },
            xid: match config.xid {
                0 => XidFormat::TextHex,
                1 => XidFormat::TextDec,
                _ => XidFormat::Numeric,
            },
            timestamp: config.timestamp,
            timestamp_tz: config.timestamp_tz,
            timestamp_all: config.timestamp_all != 0,
            char_format: config.char_format,
            scn: if config.scn == 0 { ScnFormat::Numeric } else { ScnFormat::TextHex },
            scn_type: config.scn_type,
            unknown: if config.unknown == 0 { UnknownFormat::QuestionMark } else { UnknownFormat::Dump },
            schema: config.schema,
            column: match config.column {
                0 => ColumnFormat::Changed,
                1 => ColumnFormat::FullInsDec,
                _ => ColumnFormat::FullUpd,
            },
            unknown_type: if config.unknown_type == 0 { UnknownType::Hide } else { UnknownType::Show },
            flush_buffer: config.flush_buffer,
        }
    }

    pub fn msg_full(&self) -> bool {
        self.message & MSG_FULL != 0
    }

    pub fn skip_begin(&self) -> bool {
        self.message & MSG_SKIP_BEGIN != 0
    }

    pub fn skip_commit(&self) -> bool {
        self.message & MSG_SKIP_COMMIT != 0
    }

    pub fn add_sequences(&self) -> bool {
        self.message & MSG_ADD_SEQUENCES != 0
    }

    pub fn add_offset(&self) -> bool {
        self.message & MSG_ADD_OFFSET != 0
    }

    pub fn scn_all_payloads(&self) -> bool {
        self.scn_type & SCN_ALL_PAYLOADS != 0
    }

    pub fn scn_commit_value(&self) -> bool {
        self.scn_type & SCN_COMMIT_VALUE != 0
    }

    pub fn schema_full(&self) -> bool {
        self.schema & SCHEMA_FULL != 0
    }

    pub fn schema_repeated(&self) -> bool {
        self.schema & SCHEMA_REPEATED != 0
    }

    pub fn schema_obj(&self) -> bool {
        self.schema & SCHEMA_OBJ != 0
    }
}

/// Message-level header fields, resolved by the builder.
#[derive(Debug, Clone)]
pub struct MsgHeader<'a> {
    pub db_name: Option<&'a str>,
    pub scn: Scn,
    pub commit_time_us: i64,
    pub c_scn: Scn,
    pub c_idx: u64,
    pub xid: Xid,
    pub sequence: Seq,
    pub offset: u64,
    pub attributes: Option<&'a std::collections::HashMap<String, String>>,
}

/// Which side of the row a column belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Before,
    After,
}

/// The fixed operation set shared by serialization back-ends.
pub trait MessageFormatter {
    fn begin_msg(&mut self);
    fn write_header(&mut self, header: &MsgHeader<'_>);
    fn begin_row(&mut self, op: &str, table: Option<&TableDef>, rid: Option<String>, scn: Option<Scn>, tm: Option<i64>);
    fn write_column(&mut self, side: Side, name: &str, rendered: &str);
    fn end_row(&mut self);
    fn end_msg(&mut self) -> Vec<u8>;
}

/// JSON implementation. Payload elements are streamed into one buffer;
/// commas and nesting are tracked explicitly.
pub struct JsonFormatter {
    options: FormatOptions,
    buffer: String,
    payload_open: bool,
    row_open: bool,
    side: Option<Side>,
    side_has_columns: bool,
    payload_elements: usize,
    schema_emitted: std::collections::HashSet<u32>,
}

impl JsonFormatter {
    pub fn new(options: FormatOptions) -> Self {
        JsonFormatter {
            options,
            buffer: String::new(),
            payload_open: false,
            row_open: false,
            side: None,
            side_has_columns: false,
            payload_elements: 0,
            schema_emitted: std::collections::HashSet::new(),
        }
    }

    pub fn options(&self) -> &FormatOptions {
        &self.options
    }

    fn write_scn(&mut self, key: &str, scn: Scn) {
        match self.options.scn {
            ScnFormat::Numeric => {
                self.buffer.push_str(&format!("\"{key}\":{}", scn.as_u64()));
            }
            ScnFormat::TextHex => {
                self.buffer.push_str(&format!("\"{key}s\":\"0x{:016x}\"", scn.as_u64()));
            }
        }
    }

    fn write_timestamp(&mut self, key: &str, micros: i64) {
        let rendered = format_timestamp(micros, self.options.timestamp);
        match rendered {
            TimestampText::Number(n) => self.buffer.push_str(&format!("\"{key}\":{n}")),
            TimestampText::Text(s) => self.buffer.push_str(&format!("\"{key}s\":\"{s}\"")),
        }
    }

    fn write_xid(&mut self, xid: Xid) {
        match self.options.xid {
            XidFormat::TextHex => self.buffer.push_str(&format!("\"xid\":\"{}\"", xid.to_hex())),
            XidFormat::TextDec => self.buffer.push_str(&format!(
                "\"xid\":\"{}.{}.{}\"",
                xid.usn, xid.slot, xid.sequence
            )),
            XidFormat::Numeric => self.buffer.push_str(&format!("\"xidn\":{}", xid.as_u64())),
        }
    }

    fn write_schema(&mut self, table: &TableDef) {
        self.buffer.push_str(&format!(
            "\"schema\":{{\"owner\":\"{}\",\"table\":\"{}\"",
            escape_json(&table.owner),
            escape_json(&table.name)
        ));
        if self.options.schema_obj() {
            self.buffer.push_str(&format!(",\"obj\":{}", table.obj));
        }
        if self.options.schema_full() {
            let repeat = self.options.schema_repeated();
            if repeat || self.schema_emitted.insert(table.obj) {
                self.buffer.push_str(",\"columns\":[");
                for (i, column) in table.columns.iter().enumerate() {
                    if i > 0 {
                        self.buffer.push(',');
                    }
                    self.buffer.push_str(&format!(
                        "{{\"name\":\"{}\",\"type\":\"{}\",\"key\":{}}}",
                        escape_json(&column.name),
                        column_type_name(column.col_type),
                        column.is_key
                    ));
                }
                self.buffer.push(']');
            }
        }
        self.buffer.push('}');
    }

    fn close_side(&mut self) {
        if self.side.is_some() {
            self.buffer.push('}');
            self.side = None;
            self.side_has_columns = false;
        }
    }
}

impl MessageFormatter for JsonFormatter {
    fn begin_msg(&mut self) {
        self.buffer.clear();
        self.buffer.push('{');
        self.payload_open = false;
        self.row_open = false;
        self.side = None;
        self.payload_elements = 0;
    }

    fn write_header(&mut self, header: &MsgHeader<'_>) {
        if let Some(db) = header.db_name {
            self.buffer.push_str(&format!("\"db\":\"{}\",", escape_json(db)));
        }
        self.write_scn("scn", header.scn);
        self.buffer.push(',');
        self.write_timestamp("tm", header.commit_time_us);
        self.buffer.push(',');
        self.buffer.push_str(&format!("\"c_scn\":{},", header.c_scn.as_u64()));
        self.buffer.push_str(&format!("\"c_idx\":{},", header.c_idx));
        if self.options.add_sequences() {
            self.buffer.push_str(&format!("\"sequence\":{},", header.sequence));
        }
        if self.options.add_offset() {
            self.buffer.push_str(&format!("\"offset\":{},", header.offset));
        }
        self.write_xid(header.xid);
        if let Some(attributes) = header.attributes {
            if !attributes.is_empty() {
                self.buffer.push_str(",\"attributes\":{");
                let mut keys: Vec<&String> = attributes.keys().collect();
                keys.sort();
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        self.buffer.push(',');
                    }
                    self.buffer.push_str(&format!(
                        "\"{}\":\"{}\"",
                        escape_json(key),
                        escape_json(&attributes[*key])
                    ));
                }
                self.buffer.push('}');
            }
        }
        self.buffer.push_str(",\"payload\":[");
        self.payload_open = true;
    }

    fn begin_row(
        &mut self,
        op: &str,
        table: Option<&TableDef>,
        rid: Option<String>,
        scn: Option<Scn>,
        tm: Option<i64>,
    ) {
        if self.payload_elements > 0 {
            self.buffer.push(',');
        }
        self.payload_elements += 1;
        self.row_open = true;
        self.buffer.push_str(&format!("{{\"op\":\"{op}\""));
        if let Some(table) = table {
            self.buffer.push(',');
            self.write_schema(table);
        }
        if let Some(rid) = rid {
            if self.options.rid == RidFormat::Text {
                self.buffer.push_str(&format!(",\"rid\":\"{rid}\""));
            }
        }
        if let Some(scn) = scn {
            if self.options.scn_all_payloads() {
                self.buffer.push(',');
                self.write_scn("scn", scn);
            }
        }
        if let Some(tm) = tm {
            if self.options.timestamp_all {
                self.buffer.push(',');
                self.write_timestamp("tm", tm);
            }
        }
    }

    fn write_column(&mut self, side: Side, name: &str, rendered: &str) {
        if self.side != Some(side) {
            self.close_side();
            let key = match side {
                Side::Before => "before",
                Side::After => "after",
            };
            self.buffer.push_str(&format!(",\"{key}\":{{"));
            self.side = Some(side);
            self.side_has_columns = false;
        }
        if self.side_has_columns {
            self.buffer.push(',');
        }
        self.buffer.push_str(&format!("\"{}\":{rendered}", escape_json(name)));
        self.side_has_columns = true;
    }

    fn end_row(&mut self) {
        self.close_side();
        if self.row_open {
            self.buffer.push('}');
            self.row_open = false;
        }
    }

    fn end_msg(&mut self) -> Vec<u8> {
        if self.payload_open {
            self.buffer.push(']');
            self.payload_open = false;
        }
        self.buffer.push('}');
        std::mem::take(&mut self.buffer).into_bytes()
    }
}

pub enum TimestampText {
    Number(String),
    Text(String),
}

/// Renders an epoch-microsecond timestamp per the `timestamp` knob:
/// 0-3 unix numbers (nano/micro/milli/second), 4-7 the same as strings,
/// 8-15 ISO-8601 variants.
pub fn format_timestamp(micros: i64, format: u32) -> TimestampText {
    match format {
        0 => TimestampText::Number((micros.saturating_mul(1000)).to_string()),
        1 => TimestampText::Number(micros.to_string()),
        2 => TimestampText::Number((micros / 1000).to_string()),
        3 => TimestampText::Number((micros / 1_000_000).to_string()),
        4 => TimestampText::Text((micros.saturating_mul(1000)).to_string()),
        5 => TimestampText::Text(micros.to_string()),
        6 => TimestampText::Text((micros / 1000).to_string()),
        7 => TimestampText::Text((micros / 1_000_000).to_string()),
        _ => {
            let datetime: DateTime<Utc> =
                DateTime::from_timestamp_micros(micros).unwrap_or_default();
            let (precision, with_tz) = match format {
                8 => (SecondsFormat::Nanos, true),
                9 => (SecondsFormat::Micros, true),
                10 => (SecondsFormat::Millis, true),
                11 => (SecondsFormat::Secs, true),
                12 => (SecondsFormat::Nanos, false),
                13 => (SecondsFormat::Micros, false),
                14 => (SecondsFormat::Millis, false),
                _ => (SecondsFormat::Secs, false),
            };
            let mut text = datetime.to_rfc3339_opts(precision, true);
            if !with_tz {
                text = text.trim_end_matches('Z').to_string();
            }
            TimestampText::Text(text)
        }
    }
}

pub fn column_type_name(col_type: crate::schema::ColumnType) -> &'static str {
    use crate::schema::ColumnType::*;
    match col_type {
        Char => "char",
        Number => "number",
        Date => "date",
        Raw => "raw",
        Float => "float",
        Double => "double",
        Timestamp => "timestamp",
        TimestampTz => "timestamp-tz",
        IntervalDts => "interval-dts",
        IntervalYtm => "interval-ytm",
        Rowid => "rowid",
        Clob => "clob",
        Blob => "blob",
        Unknown => "unknown",
    }
}

/// Escapes a string for embedding in JSON, keeping UTF-8 intact.
pub fn escape_json(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FormatConfig;

    fn options() -> FormatOptions {
        FormatOptions::from_config(&FormatConfig::default())
    }

    fn header(scn: u64, c_scn: u64, c_idx: u64, xid: Xid) -> MsgHeader<'static> {
        MsgHeader {
            db_name: None,
            scn: Scn::new(scn),
            commit_time_us: 1_700_000_000_000_000,
            c_scn: Scn::new(c_scn),
            c_idx,
            xid,
            sequence: 1,
            offset: 0,
            attributes: None,
        }
    }

    #[test]
    fn insert_message_shape() {
        let mut formatter = JsonFormatter::new(options());
        formatter.begin_msg();
        formatter.write_header(&header(1001, 1000, 0, Xid::new(1, 1, 1)));
        formatter.begin_row("c", None, None, Some(Scn::new(1000)), None);
        formatter.write_column(Side::After, "COL_1", "\"A\"");
        formatter.end_row();
        let bytes = formatter.end_msg();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["c_scn"], 1000);
        assert_eq!(json["c_idx"], 0);
        assert_eq!(json["scn"], 1001);
        assert_eq!(json["xid"], "0x0001.001.00000001");
        assert_eq!(json["payload"][0]["op"], "c");
        assert_eq!(json["payload"][0]["after"]["COL_1"], "A");
    }

    #[test]
    fn before_and_after_sides() {
        let mut formatter = JsonFormatter::new(options());
        formatter.begin_msg();
        formatter.write_header(&header(10, 9, 0, Xid::new(1, 0, 1)));
        formatter.begin_row("u", None, None, None, None);
        formatter.write_column(Side::Before, "C2", "\"x\"");
        formatter.write_column(Side::After, "C2", "\"y\"");
        formatter.end_row();
        let json: serde_json::Value = serde_json::from_slice(&formatter.end_msg()).unwrap();

        assert_eq!(json["payload"][0]["before"]["C2"], "x");
        assert_eq!(json["payload"][0]["after"]["C2"], "y");
    }

    #[test]
    fn scn_hex_format() {
        let mut config = FormatConfig::default();
        config.scn = 1;
        let mut formatter = JsonFormatter::new(FormatOptions::from_config(&config));
        formatter.begin_msg();
        formatter.write_header(&header(0x1234, 9, 0, Xid::new(1, 0, 1)));
        let json: serde_json::Value = serde_json::from_slice(&formatter.end_msg()).unwrap();
        assert_eq!(json["scns"], "0x0000000000001234");
    }

    #[test]
    fn multiple_payload_elements_are_separated() {
        let mut formatter = JsonFormatter::new(options());
        formatter.begin_msg();
        formatter.write_header(&header(10, 9, 0, Xid::new(1, 0, 1)));
        formatter.begin_row("begin", None, None, None, None);
        formatter.end_row();
        formatter.begin_row("c", None, None, None, None);
        formatter.write_column(Side::After, "A", "1");
        formatter.end_row();
        formatter.begin_row("commit", None, None, None, None);
        formatter.end_row();
        let json: serde_json::Value = serde_json::from_slice(&formatter.end_msg()).unwrap();
        assert_eq!(json["payload"].as_array().unwrap().len(), 3);
        assert_eq!(json["payload"][2]["op"], "commit");
    }

    #[test]
    fn timestamp_iso_variants() {
        match format_timestamp(1_700_000_000_000_000, 11) {
            TimestampText::Text(s) => assert!(s.ends_with('Z')),
            _ => panic!("expected text"),
        }
        match format_timestamp(1_700_000_000_000_000, 1) {
            TimestampText::Number(n) => assert_eq!(n, "1700000000000000"),
            _ => panic!("expected number"),
        }
    }

    #[test]
    fn escapes_control_characters() {
        assert_eq!(escape_json("a\"b"), "a\\\"b");
        assert_eq!(escape_json("line\nbreak"), "line\\nbreak");
        assert_eq!(escape_json("nul\u{1}"), "nul\\u0001");
    }
}
