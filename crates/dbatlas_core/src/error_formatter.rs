use crate::DbError;

/// Structured driver error, flattened into a single `DbError` message.
#[derive(Debug, Clone, Default)]
pub struct FormattedError {
    pub message: String,

    /// Additional detail (e.g., PostgreSQL's DETAIL field).
    pub detail: Option<String>,

    /// Suggested fix (e.g., PostgreSQL's HINT field).
    pub hint: Option<String>,

    /// SQLSTATE, MySQL error number or ORA- code.
    pub code: Option<String>,

    pub location: Option<ErrorLocation>,
}

impl FormattedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_location(mut self, location: ErrorLocation) -> Self {
        if !location.is_empty() {
            self.location = Some(location);
        }
        self
    }

    pub fn to_display_string(&self) -> String {
        let mut parts = vec![self.message.clone()];

        if let Some(ref detail) = self.detail {
            parts.push(format!("Detail: {}", detail));
        }

        if let Some(ref hint) = self.hint {
            parts.push(format!("Hint: {}", hint));
        }

        if let Some(ref loc) = self.location {
            if let Some(ref table) = loc.table {
                parts.push(format!("Table: {}", table));
            }
            if let Some(ref column) = loc.column {
                parts.push(format!("Column: {}", column));
            }
            if let Some(ref constraint) = loc.constraint {
                parts.push(format!("Constraint: {}", constraint));
            }
        }

        if let Some(ref code) = self.code {
            parts.push(format!("Code: {}", code));
        }

        parts.join(". ")
    }

    pub fn into_query_error(self) -> DbError {
        DbError::QueryFailed(self.to_display_string())
    }

    pub fn into_connection_error(self) -> DbError {
        DbError::ConnectionFailed(self.to_display_string())
    }
}

/// Where in the schema a database error originated.
#[derive(Debug, Clone, Default)]
pub struct ErrorLocation {
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub constraint: Option<String>,
}

impl ErrorLocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, schema: Option<impl Into<String>>) -> Self {
        self.schema = schema.map(Into::into);
        self
    }

    pub fn with_table(mut self, table: Option<impl Into<String>>) -> Self {
        self.table = table.map(Into::into);
        self
    }

    pub fn with_column(mut self, column: Option<impl Into<String>>) -> Self {
        self.column = column.map(Into::into);
        self
    }

    pub fn with_constraint(mut self, constraint: Option<impl Into<String>>) -> Self {
        self.constraint = constraint.map(Into::into);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.schema.is_none()
            && self.table.is_none()
            && self.column.is_none()
            && self.constraint.is_none()
    }
}

/// Masks a hostname or IPv4 address for external logs.
///
/// `10.1.2.3` becomes `10.*.*.3`; `db.prod.example.com` keeps only its first
/// and last label.
pub fn mask_host(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();

    if labels.len() < 2 {
        return match host.chars().next() {
            Some(first) if host.chars().count() > 2 => format!("{}***", first),
            _ => "***".to_string(),
        };
    }

    let last = labels.len() - 1;
    labels
        .iter()
        .enumerate()
        .map(|(i, label)| if i == 0 || i == last { *label } else { "*" })
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatted_error_display() {
        let err = FormattedError::new("syntax error")
            .with_detail("near 'FROM'")
            .with_code("42601");

        assert_eq!(
            err.to_display_string(),
            "syntax error. Detail: near 'FROM'. Code: 42601"
        );
    }

    #[test]
    fn empty_location_is_dropped() {
        let err = FormattedError::new("duplicate key").with_location(ErrorLocation::new());
        assert!(err.location.is_none());

        let err = FormattedError::new("duplicate key")
            .with_location(ErrorLocation::new().with_table(Some("users")));
        assert_eq!(err.to_display_string(), "duplicate key. Table: users");
    }

    #[test]
    fn mask_host_keeps_outer_labels() {
        assert_eq!(mask_host("10.1.2.3"), "10.*.*.3");
        assert_eq!(mask_host("db.prod.example.com"), "db.*.*.com");
        assert_eq!(mask_host("localhost"), "l***");
        assert_eq!(mask_host("db"), "***");
    }
}
