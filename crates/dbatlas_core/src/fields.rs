use crate::params::{Dialect, IdentifierCase};
use crate::{RawRow, Value};
use std::collections::BTreeMap;

/// Canonical field name → raw column name resolution for one dialect.
///
/// Catalog queries alias their columns to canonical lower-case names, but
/// Oracle folds unquoted aliases to upper case and some views ignore the
/// alias entirely. All mapping code reads rows through this table: the
/// query's own `result_mapping` first, then the dialect's identifier case,
/// then the opposite case.
#[derive(Debug, Clone)]
pub struct FieldAliases<'a> {
    case: IdentifierCase,
    mapping: Option<&'a BTreeMap<String, String>>,
}

impl<'a> FieldAliases<'a> {
    pub fn for_dialect(dialect: Dialect) -> Self {
        Self {
            case: dialect.identifier_case(),
            mapping: None,
        }
    }

    pub fn with_mapping(mut self, mapping: &'a BTreeMap<String, String>) -> Self {
        if !mapping.is_empty() {
            self.mapping = Some(mapping);
        }
        self
    }

    /// Raw column names to try for a canonical field, most specific first.
    pub fn candidates(&self, canonical: &str) -> Vec<String> {
        let mut names = Vec::with_capacity(4);

        if let Some(raw) = self.mapping.and_then(|m| m.get(canonical)) {
            names.push(raw.clone());
            names.push(self.case.apply(raw));
        }

        names.push(self.case.apply(canonical));
        names.push(self.case.opposite().apply(canonical));
        names.dedup();
        names
    }

    pub fn value<'r>(&self, row: &'r RawRow, canonical: &str) -> Option<&'r Value> {
        self.candidates(canonical)
            .iter()
            .find_map(|name| row.get(name))
            .filter(|value| !value.is_null())
    }

    pub fn text(&self, row: &RawRow, canonical: &str) -> Option<String> {
        self.value(row, canonical).and_then(Value::as_text)
    }

    /// Like `text`, but blank strings count as absent.
    pub fn non_empty_text(&self, row: &RawRow, canonical: &str) -> Option<String> {
        self.text(row, canonical).filter(|s| !s.trim().is_empty())
    }

    pub fn flag(&self, row: &RawRow, canonical: &str) -> bool {
        self.value(row, canonical).is_some_and(Value::as_flag)
    }

    pub fn int(&self, row: &RawRow, canonical: &str) -> Option<i64> {
        self.value(row, canonical).and_then(Value::as_i64)
    }

    pub fn float(&self, row: &RawRow, canonical: &str) -> Option<f64> {
        self.value(row, canonical).and_then(Value::as_f64)
    }
}
