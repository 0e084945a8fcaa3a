use chrono::{SecondsFormat, Utc};

use crate::error::StoreError;

/// Current UTC time as RFC 3339 with fixed microsecond precision, so that
/// lexical order of stored timestamps equals chronological order.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::messages::Role;

    #[test]
    fn timestamps_sort_lexically() {
        let a = now_rfc3339();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_rfc3339();
        assert!(a < b, "{a} !< {b}");
        assert!(a.ends_with('Z'));
    }

    #[test]
    fn parse_enum_success() {
        let result: Result<Role, _> = parse_enum("assistant", "chat_messages", "role");
        assert_eq!(result.unwrap(), Role::Assistant);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<Role, _> = parse_enum("system", "chat_messages", "role");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "chat_messages", column: "role", .. })
        ));
    }
}
