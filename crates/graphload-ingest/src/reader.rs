//! Record reader
//!
//! Turns a decompressed byte stream into a lazy sequence of raw records. A
//! raw record is an ordered list of opaque text fields; typing is left to the
//! field mapper. Both readers pull bytes on demand, so memory use does not
//! grow with the size of the source.
//!
//! Iteration blocks on I/O and must run on the blocking pool.

use serde::Deserialize;
use serde_json::Value;
use std::io::{self, BufRead, BufReader};
use thiserror::Error;

use crate::config::{FieldSpec, Format};
use crate::source::ByteStream;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// One record as read from a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// 1-based position in the source, header excluded
    pub ordinal: u64,
    pub fields: Vec<String>,
    /// Key of each field when the record was a JSON object
    pub keys: Option<Vec<String>>,
}

impl RawRecord {
    pub fn new(ordinal: u64, fields: Vec<String>) -> Self {
        Self {
            ordinal,
            fields,
            keys: None,
        }
    }

    /// Record read from a JSON object; `keys[i]` names `fields[i]`
    pub fn keyed(ordinal: u64, keys: Vec<String>, fields: Vec<String>) -> Self {
        Self {
            ordinal,
            fields,
            keys: Some(keys),
        }
    }

    /// Value stored under `key`, if the record has keys and that one is present
    pub fn get_key(&self, key: &str) -> Option<&str> {
        let position = self.keys.as_ref()?.iter().position(|k| k == key)?;
        self.fields.get(position).map(String::as_str)
    }
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("record {ordinal} is malformed: {reason}")]
    Malformed { ordinal: u64, reason: String },

    #[error("stream failed while reading record {ordinal}: {source}")]
    Io {
        ordinal: u64,
        #[source]
        source: io::Error,
    },
}

impl RecordError {
    pub fn ordinal(&self) -> u64 {
        match self {
            RecordError::Malformed { ordinal, .. } | RecordError::Io { ordinal, .. } => *ordinal,
        }
    }
}

pub type RecordStream = Box<dyn Iterator<Item = Result<RawRecord, RecordError>> + Send>;

/// Lazily read `stream` as `format`.
///
/// `separator` and `header` only apply to CSV. The returned iterator is fused
/// after the first error.
pub fn read(stream: ByteStream, format: Format, separator: u8, header: bool) -> RecordStream {
    match format {
        Format::Csv => Box::new(CsvRecords::new(stream, separator, header)),
        Format::Json => Box::new(JsonRecords::new(stream)),
    }
}

struct CsvRecords {
    reader: csv::Reader<ByteStream>,
    record: csv::StringRecord,
    ordinal: u64,
    done: bool,
}

impl CsvRecords {
    fn new(stream: ByteStream, separator: u8, header: bool) -> Self {
        let reader = csv::ReaderBuilder::new()
            .delimiter(separator)
            .has_headers(header)
            .flexible(true)
            .trim(csv::Trim::None)
            .from_reader(stream);
        Self {
            reader,
            record: csv::StringRecord::new(),
            ordinal: 0,
            done: false,
        }
    }
}

impl Iterator for CsvRecords {
    type Item = Result<RawRecord, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let ordinal = self.ordinal + 1;
        match self.reader.read_record(&mut self.record) {
            Ok(true) => {
                self.ordinal = ordinal;
                let fields = self.record.iter().map(str::to_string).collect();
                Some(Ok(RawRecord::new(ordinal, fields)))
            },
            Ok(false) => {
                self.done = true;
                None
            },
            Err(e) => {
                self.done = true;
                Some(Err(csv_error(ordinal, e)))
            },
        }
    }
}

fn csv_error(ordinal: u64, err: csv::Error) -> RecordError {
    if !err.is_io_error() {
        return RecordError::Malformed {
            ordinal,
            reason: err.to_string(),
        };
    }
    match err.into_kind() {
        csv::ErrorKind::Io(source) => RecordError::Io { ordinal, source },
        other => RecordError::Malformed {
            ordinal,
            reason: format!("{:?}", other),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// Nothing read yet
    Unknown,
    /// Inside a top-level array
    Array { first: bool },
    /// Whitespace separated values
    Lines,
    Done,
}

struct JsonRecords {
    reader: BufReader<ByteStream>,
    layout: Layout,
    ordinal: u64,
}

impl JsonRecords {
    fn new(stream: ByteStream) -> Self {
        Self {
            reader: BufReader::new(stream),
            layout: Layout::Unknown,
            ordinal: 0,
        }
    }

    /// Skip whitespace and return the next byte without consuming it
    fn peek_non_ws(&mut self) -> io::Result<Option<u8>> {
        loop {
            let (skip, next) = {
                let buf = self.reader.fill_buf()?;
                if buf.is_empty() {
                    return Ok(None);
                }
                let skip = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
                (skip, buf.get(skip).copied())
            };
            self.reader.consume(skip);
            if next.is_some() {
                return Ok(next);
            }
        }
    }

    fn skip_bom(&mut self) -> io::Result<()> {
        let has_bom = self.reader.fill_buf()?.starts_with(UTF8_BOM);
        if has_bom {
            self.reader.consume(UTF8_BOM.len());
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<Option<RawRecord>, RecordError> {
        let ordinal = self.ordinal + 1;
        let io_err = |source| RecordError::Io { ordinal, source };
        let malformed = |reason: String| RecordError::Malformed { ordinal, reason };

        loop {
            match self.layout {
                Layout::Done => return Ok(None),
                Layout::Unknown => {
                    self.skip_bom().map_err(io_err)?;
                    self.layout = match self.peek_non_ws().map_err(io_err)? {
                        Some(b'[') => {
                            self.reader.consume(1);
                            Layout::Array { first: true }
                        },
                        Some(_) => Layout::Lines,
                        None => Layout::Done,
                    };
                },
                Layout::Lines => {
                    if self.peek_non_ws().map_err(io_err)?.is_none() {
                        self.layout = Layout::Done;
                        return Ok(None);
                    }
                    return self.parse_record(ordinal).map(Some);
                },
                Layout::Array { first } => {
                    let mut next = self.peek_non_ws().map_err(io_err)?;
                    if next == Some(b']') {
                        self.reader.consume(1);
                        if let Some(b) = self.peek_non_ws().map_err(io_err)? {
                            return Err(malformed(format!(
                                "unexpected '{}' after the top-level array",
                                b as char
                            )));
                        }
                        self.layout = Layout::Done;
                        return Ok(None);
                    }
                    if !first {
                        if next != Some(b',') {
                            return Err(malformed(match next {
                                Some(b) => format!("expected ',' or ']' but found '{}'", b as char),
                                None => "array is not terminated".to_string(),
                            }));
                        }
                        self.reader.consume(1);
                        next = self.peek_non_ws().map_err(io_err)?;
                    }
                    if next.is_none() {
                        return Err(malformed("array is not terminated".to_string()));
                    }
                    self.layout = Layout::Array { first: false };
                    return self.parse_record(ordinal).map(Some);
                },
            }
        }
    }

    /// Parse one record starting at the next non-whitespace byte
    fn parse_record(&mut self, ordinal: u64) -> Result<RawRecord, RecordError> {
        // scalars are rejected before parsing: the deserializer would
        // otherwise read one byte past a trailing number
        match self.peek_non_ws() {
            Ok(Some(b'{')) | Ok(Some(b'[')) => {},
            Ok(Some(b)) => {
                return Err(RecordError::Malformed {
                    ordinal,
                    reason: format!(
                        "record must be a JSON object or array, found '{}'",
                        b as char
                    ),
                })
            },
            Ok(None) => {
                return Err(RecordError::Malformed {
                    ordinal,
                    reason: "unexpected end of input".to_string(),
                })
            },
            Err(source) => return Err(RecordError::Io { ordinal, source }),
        }

        let mut de = serde_json::Deserializer::from_reader(&mut self.reader);
        let value = Value::deserialize(&mut de).map_err(|e| {
            if e.is_io() {
                RecordError::Io {
                    ordinal,
                    source: io::Error::from(e),
                }
            } else {
                RecordError::Malformed {
                    ordinal,
                    reason: e.to_string(),
                }
            }
        })?;

        let record = match value {
            Value::Object(map) => {
                let (keys, fields) = map.into_iter().map(|(k, v)| (k, field_text(v))).unzip();
                RawRecord::keyed(ordinal, keys, fields)
            },
            Value::Array(items) => RawRecord::new(ordinal, items.into_iter().map(field_text).collect()),
            _ => RawRecord::new(ordinal, Vec::new()),
        };
        self.ordinal = ordinal;
        Ok(record)
    }
}

impl Iterator for JsonRecords {
    type Item = Result<RawRecord, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(record) => record.map(Ok),
            Err(e) => {
                self.layout = Layout::Done;
                Some(Err(e))
            },
        }
    }
}

/// Guards positional access into JSON object records.
///
/// Objects are unordered, so a position only means the same thing across
/// records when every object lists the same keys in the same order. Once
/// enabled, the first keyed record fixes that sequence and any later record
/// that differs is malformed. Fields addressed by `key` need no guard.
#[derive(Debug, Default)]
pub struct KeyOrder {
    enabled: bool,
    expected: Option<Vec<String>>,
}

impl KeyOrder {
    /// Enabled when any field is read by position
    pub fn for_fields(fields: &[FieldSpec]) -> Self {
        Self {
            enabled: fields.iter().any(|f| f.key.is_none()),
            expected: None,
        }
    }

    pub fn check(&mut self, record: &RawRecord) -> Result<(), RecordError> {
        let Some(keys) = record.keys.as_ref().filter(|_| self.enabled) else {
            return Ok(());
        };
        match &self.expected {
            None => {
                self.expected = Some(keys.clone());
                Ok(())
            },
            Some(expected) if expected == keys => Ok(()),
            Some(expected) => Err(RecordError::Malformed {
                ordinal: record.ordinal,
                reason: format!(
                    "object keys [{}] differ from the first record's [{}]; set a key on each field to read objects by name",
                    keys.join(", "),
                    expected.join(", ")
                ),
            }),
        }
    }
}

/// Text form of a JSON value
fn field_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        // arbitrary_precision keeps the source digits
        Value::Number(n) => n.to_string(),
        nested => nested.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stream(text: &str) -> ByteStream {
        Box::new(Cursor::new(text.as_bytes().to_vec()))
    }

    fn fields(records: RecordStream) -> Vec<Vec<String>> {
        records.map(|r| r.unwrap().fields).collect()
    }

    #[test]
    fn test_csv_keeps_exact_text() {
        let records = read(
            stream("1,123456789012345,5.23456\n2,\"a, quoted\",0.10\n"),
            Format::Csv,
            b',',
            false,
        );
        assert_eq!(
            fields(records),
            vec![
                vec!["1", "123456789012345", "5.23456"],
                vec!["2", "a, quoted", "0.10"],
            ]
        );
    }

    #[test]
    fn test_csv_separator_and_header() {
        let mut records = read(stream("id|name\n7| spaced \n"), Format::Csv, b'|', true);
        let first = records.next().unwrap().unwrap();
        assert_eq!(first.ordinal, 1);
        assert_eq!(first.fields, vec!["7", " spaced "]);
        assert!(records.next().is_none());
    }

    #[test]
    fn test_csv_flexible_lengths() {
        let records = read(stream("a\nb,c,d\n"), Format::Csv, b',', false);
        assert_eq!(fields(records), vec![vec!["a"], vec!["b", "c", "d"]]);
    }

    #[test]
    fn test_csv_invalid_utf8_is_malformed() {
        let bytes: ByteStream = Box::new(Cursor::new(b"ok\n\xff\xfe\n".to_vec()));
        let mut records = read(bytes, Format::Csv, b',', false);
        assert!(records.next().unwrap().is_ok());
        match records.next().unwrap() {
            Err(RecordError::Malformed { ordinal, .. }) => assert_eq!(ordinal, 2),
            other => panic!("expected malformed record, got {:?}", other),
        }
        assert!(records.next().is_none());
    }

    #[test]
    fn test_json_array_of_objects_keeps_key_order() {
        let records = read(
            stream(r#" [ {"z": 1, "a": "x", "m": 12.50}, {"z": 2, "a": null, "m": [1, 2]} ] "#),
            Format::Json,
            b',',
            false,
        );
        assert_eq!(
            fields(records),
            vec![vec!["1", "x", "12.50"], vec!["2", "", "[1,2]"]]
        );
    }

    #[test]
    fn test_json_object_records_keep_keys() {
        let mut records = read(
            stream(r#"[{"id": 1, "name": "Ada"}, [2, "Grace"]]"#),
            Format::Json,
            b',',
            false,
        );
        let object = records.next().unwrap().unwrap();
        assert_eq!(object.keys, Some(vec!["id".to_string(), "name".to_string()]));
        assert_eq!(object.get_key("name"), Some("Ada"));
        assert_eq!(object.get_key("age"), None);

        let array = records.next().unwrap().unwrap();
        assert_eq!(array.keys, None);
        assert_eq!(array.get_key("id"), None);
    }

    fn positional(position: usize, key: Option<&str>) -> FieldSpec {
        FieldSpec {
            position,
            key: key.map(str::to_string),
            property_name: format!("p{}", position),
            explicit_type: None,
        }
    }

    #[test]
    fn test_key_order_rejects_reordered_objects() {
        let records: Vec<RawRecord> = read(
            stream(r#"[{"id": 1, "name": "Ada"}, {"id": 2, "name": "Bob"}, {"name": "Grace", "id": 3}]"#),
            Format::Json,
            b',',
            false,
        )
        .map(Result::unwrap)
        .collect();

        let mut guard = KeyOrder::for_fields(&[positional(0, None), positional(1, None)]);
        assert!(guard.check(&records[0]).is_ok());
        assert!(guard.check(&records[1]).is_ok());
        match guard.check(&records[2]) {
            Err(RecordError::Malformed { ordinal, reason }) => {
                assert_eq!(ordinal, 3);
                assert!(reason.contains("[name, id]"));
            },
            other => panic!("expected malformed record, got {:?}", other),
        }

        // every field addressed by key: order does not matter
        let mut keyed = KeyOrder::for_fields(&[positional(0, Some("id"))]);
        assert!(records.iter().all(|r| keyed.check(r).is_ok()));
    }

    #[test]
    fn test_key_order_ignores_csv_rows() {
        let mut guard = KeyOrder::for_fields(&[positional(0, None)]);
        assert!(guard.check(&RawRecord::new(1, vec!["a".to_string()])).is_ok());
        assert!(guard.check(&RawRecord::new(2, vec!["b".to_string(), "c".to_string()])).is_ok());
    }

    #[test]
    fn test_json_lines() {
        let records = read(
            stream("{\"n\": 123456789012345678901234567890}\n\n[true, \"b\"]\n"),
            Format::Json,
            b',',
            false,
        );
        let all: Vec<RawRecord> = records.map(Result::unwrap).collect();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].fields, vec!["123456789012345678901234567890"]);
        assert_eq!(all[1].ordinal, 2);
        assert_eq!(all[1].fields, vec!["true", "b"]);
    }

    #[test]
    fn test_json_with_bom_and_empty_input() {
        let records = read(stream("\u{feff}[{\"a\": 1}]"), Format::Json, b',', false);
        assert_eq!(fields(records), vec![vec!["1"]]);

        let mut empty = read(stream("  \n"), Format::Json, b',', false);
        assert!(empty.next().is_none());

        let mut empty_array = read(stream("[]"), Format::Json, b',', false);
        assert!(empty_array.next().is_none());
    }

    #[test]
    fn test_json_scalar_record_is_malformed() {
        let mut records = read(stream("{\"a\": 1}\n42\n"), Format::Json, b',', false);
        assert!(records.next().unwrap().is_ok());
        match records.next().unwrap() {
            Err(RecordError::Malformed { ordinal, reason }) => {
                assert_eq!(ordinal, 2);
                assert!(reason.contains("object or array"));
            },
            other => panic!("expected malformed record, got {:?}", other),
        }
        assert!(records.next().is_none());
    }

    #[test]
    fn test_json_unterminated_array() {
        let mut records = read(stream("[{\"a\": 1}, {\"a\": 2}"), Format::Json, b',', false);
        assert!(records.next().unwrap().is_ok());
        assert!(records.next().unwrap().is_ok());
        assert!(matches!(
            records.next(),
            Some(Err(RecordError::Malformed { ordinal: 3, .. }))
        ));
    }

    #[test]
    fn test_json_broken_element() {
        let mut records = read(stream("[{\"a\": }]"), Format::Json, b',', false);
        assert!(matches!(
            records.next(),
            Some(Err(RecordError::Malformed { ordinal: 1, .. }))
        ));
    }
}
