use crate::{DbError, Value};
use indexmap::IndexMap;

/// Placeholder style a driver expects in the SQL text it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `:name` kept as-is, values bound by name (Oracle).
    Named,
    /// `$1`, `$2`, ... one number per distinct name (PostgreSQL).
    Dollar,
    /// `?` per occurrence (MySQL).
    QuestionMark,
}

/// Named parameter values for a catalog query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamedParams {
    values: IndexMap<String, Value>,
}

impl NamedParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Only the named entries, in the order given. Absent names are skipped
    /// and reported later by `bind_named`.
    pub fn subset(&self, names: &[String]) -> NamedParams {
        let values = names
            .iter()
            .filter_map(|name| {
                self.values
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect();
        NamedParams { values }
    }
}

/// Values ready for a driver, in the form its placeholder style needs.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundParams {
    Positional(Vec<Value>),
    Named(Vec<(String, Value)>),
}

impl BoundParams {
    pub fn len(&self) -> usize {
        match self {
            BoundParams::Positional(values) => values.len(),
            BoundParams::Named(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// SQL text plus the values that go with it.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub sql: String,
    pub params: BoundParams,
}

impl BoundStatement {
    /// A statement with no parameters.
    pub fn plain(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: BoundParams::Positional(Vec::new()),
        }
    }

    pub fn positional(&self) -> Result<&[Value], DbError> {
        match &self.params {
            BoundParams::Positional(values) => Ok(values),
            BoundParams::Named(_) => Err(DbError::NotSupported(
                "named parameters are not supported by this driver".to_string(),
            )),
        }
    }

    /// Parameter list for logs: names or positions, values always `***`.
    pub fn masked_params(&self) -> String {
        let parts: Vec<String> = match &self.params {
            BoundParams::Positional(values) => {
                (1..=values.len()).map(|i| format!("${}=***", i)).collect()
            }
            BoundParams::Named(values) => values
                .iter()
                .map(|(name, _)| format!(":{}=***", name))
                .collect(),
        };
        format!("[{}]", parts.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Placeholder {
    start: usize,
    end: usize,
    name: String,
}

/// Finds `:name` placeholders outside literals, quoted identifiers and
/// comments. `::type` casts are skipped.
fn scan_placeholders(sql: &str) -> Vec<Placeholder> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 2;
            }
            b':' if bytes.get(i + 1) == Some(&b':') => {
                i += 2;
            }
            b':' if bytes
                .get(i + 1)
                .is_some_and(|b| b.is_ascii_alphabetic() || *b == b'_') =>
            {
                let start = i;
                i += 1;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                found.push(Placeholder {
                    start,
                    end: i,
                    name: sql[start + 1..i].to_string(),
                });
            }
            _ => i += 1,
        }
    }

    found
}

/// Distinct placeholder names in first-occurrence order.
pub fn placeholder_names(sql: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for placeholder in scan_placeholders(sql) {
        if !names.contains(&placeholder.name) {
            names.push(placeholder.name);
        }
    }
    names
}

/// Rewrites `:name` placeholders for a driver and orders the values to match.
pub fn bind_named(
    sql: &str,
    params: &NamedParams,
    style: PlaceholderStyle,
) -> Result<BoundStatement, DbError> {
    let placeholders = scan_placeholders(sql);

    let lookup = |name: &str| {
        params.get(name).cloned().ok_or_else(|| {
            DbError::invalid_params(format!("no value bound for placeholder :{}", name))
        })
    };

    if style == PlaceholderStyle::Named {
        let mut values: Vec<(String, Value)> = Vec::new();
        for placeholder in &placeholders {
            if !values.iter().any(|(name, _)| name == &placeholder.name) {
                values.push((placeholder.name.clone(), lookup(&placeholder.name)?));
            }
        }
        return Ok(BoundStatement {
            sql: sql.to_string(),
            params: BoundParams::Named(values),
        });
    }

    let mut rewritten = String::with_capacity(sql.len());
    let mut values: Vec<Value> = Vec::new();
    let mut numbering: Vec<&str> = Vec::new();
    let mut cursor = 0;

    for placeholder in &placeholders {
        rewritten.push_str(&sql[cursor..placeholder.start]);
        cursor = placeholder.end;

        match style {
            PlaceholderStyle::Dollar => {
                let position = match numbering.iter().position(|n| *n == placeholder.name) {
                    Some(existing) => existing + 1,
                    None => {
                        values.push(lookup(&placeholder.name)?);
                        numbering.push(&placeholder.name);
                        numbering.len()
                    }
                };
                rewritten.push('$');
                rewritten.push_str(&position.to_string());
            }
            PlaceholderStyle::QuestionMark => {
                values.push(lookup(&placeholder.name)?);
                rewritten.push('?');
            }
            PlaceholderStyle::Named => {}
        }
    }
    rewritten.push_str(&sql[cursor..]);

    Ok(BoundStatement {
        sql: rewritten,
        params: BoundParams::Positional(values),
    })
}

/// Single-line, length-capped SQL for log messages.
pub fn sql_preview(sql: &str) -> String {
    const MAX_PREVIEW: usize = 120;

    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= MAX_PREVIEW {
        collapsed
    } else {
        let truncated: String = collapsed.chars().take(MAX_PREVIEW).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> NamedParams {
        NamedParams::new()
            .with("schema", "public")
            .with("table", "orders")
    }

    const SQL: &str =
        "SELECT * FROM t WHERE s = :schema AND n = :table AND (s2 = :schema OR :schema IS NULL)";

    #[test]
    fn dollar_style_numbers_by_first_occurrence() {
        let bound = bind_named(SQL, &params(), PlaceholderStyle::Dollar).expect("binds");

        assert_eq!(
            bound.sql,
            "SELECT * FROM t WHERE s = $1 AND n = $2 AND (s2 = $1 OR $1 IS NULL)"
        );
        assert_eq!(
            bound.params,
            BoundParams::Positional(vec![Value::text("public"), Value::text("orders")])
        );
    }

    #[test]
    fn question_mark_style_repeats_values() {
        let bound = bind_named(SQL, &params(), PlaceholderStyle::QuestionMark).expect("binds");

        assert_eq!(
            bound.sql,
            "SELECT * FROM t WHERE s = ? AND n = ? AND (s2 = ? OR ? IS NULL)"
        );
        assert_eq!(bound.params.len(), 4);
    }

    #[test]
    fn named_style_keeps_sql() {
        let bound = bind_named(SQL, &params(), PlaceholderStyle::Named).expect("binds");

        assert_eq!(bound.sql, SQL);
        assert_eq!(
            bound.params,
            BoundParams::Named(vec![
                ("schema".to_string(), Value::text("public")),
                ("table".to_string(), Value::text("orders")),
            ])
        );
    }

    #[test]
    fn casts_literals_and_comments_are_not_placeholders() {
        let sql = "SELECT ':skip', \"col:x\" -- :also\n FROM t /* :nope */ WHERE a = :schema::text";
        assert_eq!(placeholder_names(sql), vec!["schema".to_string()]);

        let bound = bind_named(sql, &params(), PlaceholderStyle::Dollar).expect("binds");
        assert!(bound.sql.ends_with("WHERE a = $1::text"));
    }

    #[test]
    fn missing_value_is_invalid_params() {
        let err = bind_named("SELECT :owner", &NamedParams::new(), PlaceholderStyle::Dollar)
            .expect_err("should fail");
        assert!(matches!(err, DbError::InvalidParams(ref msg) if msg.contains(":owner")));
    }

    #[test]
    fn subset_keeps_declared_order() {
        let subset = params().subset(&["table".to_string(), "missing".to_string()]);
        let names: Vec<&String> = subset.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["table"]);
    }

    #[test]
    fn masked_params_hide_values() {
        let bound = bind_named(SQL, &params(), PlaceholderStyle::Named).expect("binds");
        assert_eq!(bound.masked_params(), "[:schema=***, :table=***]");
        assert!(!bound.masked_params().contains("public"));
    }

    #[test]
    fn preview_collapses_whitespace() {
        assert_eq!(sql_preview("SELECT\n   1\n FROM dual"), "SELECT 1 FROM dual");
        assert!(sql_preview(&"x ".repeat(200)).ends_with("..."));
    }
}
