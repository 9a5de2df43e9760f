//! Legacy character-set recovery.
//!
//! Some legacy databases store multi-byte text (GBK, Big5, Shift_JIS, ...)
//! in columns declared with a single-byte character set. The driver then
//! decodes those bytes as Latin-1 and hands back mojibake. The functions here
//! recover the original bytes and decode them with the encoding the data was
//! really written in.

use crate::binding::BoundStatement;
use crate::handle::PooledHandle;
use crate::params::Dialect;
use crate::row::{RawResult, RawRow, RowCursor};
use crate::{DbError, Value};
use async_trait::async_trait;
use encoding_rs::Encoding;
use std::borrow::Cow;
use std::sync::Arc;

/// Decodes `raw` with the encoding named by `encoding_name`.
///
/// ASCII input is returned untouched. An unknown encoding name degrades to
/// the single-byte view of `raw` (one char per byte), which loses nothing and
/// can still be decoded later with the right label.
pub fn decode(raw: &[u8], encoding_name: &str) -> String {
    CharsetDecoder::new(encoding_name).decode_bytes(raw).into_owned()
}

/// Stateless transform bound to one target encoding.
#[derive(Debug, Clone)]
pub struct CharsetDecoder {
    label: String,
    encoding: Option<&'static Encoding>,
}

impl CharsetDecoder {
    /// Unknown labels produce a byte-preserving decoder and a warning.
    pub fn new(label: &str) -> Self {
        let encoding = Encoding::for_label(label.trim().as_bytes());

        if encoding.is_none() {
            log::warn!(
                "[CHARSET] Unknown encoding '{}'; legacy text will be returned as-is",
                label
            );
        }

        Self {
            label: label.to_string(),
            encoding,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_identity(&self) -> bool {
        self.encoding.is_none()
    }

    pub fn decode_bytes<'a>(&self, raw: &'a [u8]) -> Cow<'a, str> {
        if raw.is_ascii() {
            return String::from_utf8_lossy(raw);
        }

        match self.encoding {
            Some(encoding) => {
                let (text, had_errors) = encoding.decode_without_bom_handling(raw);
                if had_errors {
                    log::debug!(
                        "[CHARSET] {} replacement characters while decoding as {}",
                        text.matches('\u{FFFD}').count(),
                        self.label
                    );
                }
                text
            }
            None => Cow::Owned(raw.iter().map(|b| char::from(*b)).collect()),
        }
    }

    /// Recovers text a driver decoded as Latin-1.
    ///
    /// Only strings made entirely of code points up to U+00FF can be
    /// misdecoded single-byte data; anything else is already real Unicode
    /// and is returned unchanged, which keeps the transform idempotent.
    pub fn decode_text<'a>(&self, text: &'a str) -> Cow<'a, str> {
        if text.is_ascii() || self.encoding.is_none() {
            return Cow::Borrowed(text);
        }

        let mut raw = Vec::with_capacity(text.len());
        for ch in text.chars() {
            match u8::try_from(u32::from(ch)) {
                Ok(byte) => raw.push(byte),
                Err(_) => return Cow::Borrowed(text),
            }
        }

        Cow::Owned(self.decode_bytes(&raw).into_owned())
    }

    /// Applies recovery to text leaves; other values keep their shape.
    pub fn decode_value(&self, value: Value) -> Value {
        match value {
            Value::Text(text) => match self.decode_text(&text) {
                Cow::Borrowed(_) => Value::Text(text),
                Cow::Owned(decoded) => Value::Text(decoded),
            },
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.decode_value(v)).collect())
            }
            other => other,
        }
    }

    pub fn decode_row(&self, row: RawRow) -> RawRow {
        if self.is_identity() {
            return row;
        }
        row.map_values(|value| self.decode_value(value))
    }

    fn decode_values(&self, values: Vec<Value>) -> Vec<Value> {
        values.into_iter().map(|v| self.decode_value(v)).collect()
    }

    /// Applies recovery to every row of a raw result, whatever its shape.
    pub fn decode_result(self: &Arc<Self>, result: RawResult) -> RawResult {
        if self.is_identity() {
            return result;
        }

        match result {
            RawResult::TupleRows { fields, rows } => RawResult::TupleRows {
                fields,
                rows: rows.into_iter().map(|r| self.decode_values(r)).collect(),
            },
            RawResult::RowsObject { columns, rows } => RawResult::RowsObject {
                columns,
                rows: rows.into_iter().map(|r| self.decode_values(r)).collect(),
            },
            RawResult::DirectArray(rows) => {
                RawResult::DirectArray(rows.into_iter().map(|r| self.decode_row(r)).collect())
            }
            RawResult::Cursor(inner) => RawResult::Cursor(Box::new(DecodingCursor {
                inner,
                decoder: Arc::clone(self),
            })),
        }
    }
}

struct DecodingCursor {
    inner: Box<dyn RowCursor>,
    decoder: Arc<CharsetDecoder>,
}

#[async_trait]
impl RowCursor for DecodingCursor {
    async fn next_row(&mut self) -> Result<Option<RawRow>, DbError> {
        let row = self.inner.next_row().await?;
        Ok(row.map(|r| self.decoder.decode_row(r)))
    }

    async fn close(&mut self) -> Result<(), DbError> {
        self.inner.close().await
    }
}

/// Pooled handle decorator that runs every returned row through a
/// `CharsetDecoder`. Installed by the connection manager when the
/// connection parameters name a legacy charset.
pub struct CharsetHandle {
    inner: Arc<dyn PooledHandle>,
    decoder: Arc<CharsetDecoder>,
}

impl CharsetHandle {
    pub fn new(inner: Arc<dyn PooledHandle>, decoder: CharsetDecoder) -> Self {
        Self {
            inner,
            decoder: Arc::new(decoder),
        }
    }

    pub fn decoder(&self) -> &CharsetDecoder {
        &self.decoder
    }
}

#[async_trait]
impl PooledHandle for CharsetHandle {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    async fn query_raw(&self, statement: &BoundStatement) -> Result<RawResult, DbError> {
        let result = self.inner.query_raw(statement).await?;
        Ok(self.decoder.decode_result(result))
    }

    async fn ping(&self) -> Result<(), DbError> {
        self.inner.ping().await
    }

    async fn close(&self) -> Result<(), DbError> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn as_latin1(bytes: &[u8]) -> String {
        bytes.iter().map(|b| char::from(*b)).collect()
    }

    #[test]
    fn ascii_is_returned_unchanged_for_any_encoding() {
        for label in ["gbk", "big5", "shift_jis", "not-a-charset"] {
            assert_eq!(decode(b"ORDER_ID 42", label), "ORDER_ID 42");
        }
    }

    #[test]
    fn gbk_bytes_decode_to_original_text() {
        let (bytes, _, _) = encoding_rs::GBK.encode("客户订单");
        assert_eq!(decode(&bytes, "gbk"), "客户订单");
    }

    #[test]
    fn latin1_mojibake_is_recovered() {
        let (bytes, _, _) = encoding_rs::GBK.encode("订单状态");
        let garbled = as_latin1(&bytes);

        let decoder = CharsetDecoder::new("GBK");
        assert_eq!(decoder.decode_text(&garbled), "订单状态");
    }

    #[test]
    fn recovery_is_idempotent() {
        let decoder = CharsetDecoder::new("gbk");
        let (bytes, _, _) = encoding_rs::GBK.encode("客户");
        let once = decoder.decode_value(Value::Text(as_latin1(&bytes)));
        let twice = decoder.decode_value(once.clone());

        assert_eq!(once, Value::text("客户"));
        assert_eq!(twice, once);
    }

    #[test]
    fn unknown_encoding_is_identity() {
        let decoder = CharsetDecoder::new("x-klingon");
        assert!(decoder.is_identity());

        let garbled = Value::text("Ã¿Ã¾");
        assert_eq!(decoder.decode_value(garbled.clone()), garbled);
    }

    #[test]
    fn unknown_encoding_keeps_non_ascii_bytes_recoverable() {
        let raw = [0xB6, 0xA9, 0xB5, 0xA5];
        let kept = decode(&raw, "x-klingon");
        assert_eq!(kept, "\u{B6}\u{A9}\u{B5}\u{A5}");
        assert!(!kept.contains('\u{FFFD}'));

        let recovered = CharsetDecoder::new("gbk").decode_text(&kept);
        assert_eq!(recovered, "订单");
    }

    #[test]
    fn nested_values_keep_shape_and_skip_non_text() {
        let decoder = CharsetDecoder::new("gbk");
        let (bytes, _, _) = encoding_rs::GBK.encode("名称");
        let date = NaiveDate::from_ymd_opt(2024, 1, 31).expect("valid date");

        let value = Value::Array(vec![
            Value::Text(as_latin1(&bytes)),
            Value::Date(date),
            Value::Bytes(bytes.to_vec()),
            Value::Array(vec![Value::Int(7)]),
        ]);

        assert_eq!(
            decoder.decode_value(value),
            Value::Array(vec![
                Value::text("名称"),
                Value::Date(date),
                Value::Bytes(bytes.to_vec()),
                Value::Array(vec![Value::Int(7)]),
            ])
        );
    }

    #[test]
    fn rows_decode_every_column() {
        let decoder = CharsetDecoder::new("gbk");
        let (bytes, _, _) = encoding_rs::GBK.encode("备注");
        let row = RawRow::new()
            .with("COMMENTS", as_latin1(&bytes))
            .with("TABLE_NAME", "ORDERS");

        let decoded = decoder.decode_row(row);
        assert_eq!(decoded.get("COMMENTS"), Some(&Value::text("备注")));
        assert_eq!(decoded.get("TABLE_NAME"), Some(&Value::text("ORDERS")));
    }
}
