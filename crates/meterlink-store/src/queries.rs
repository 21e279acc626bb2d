//! Query builder for stored profile rows.
//!
//! # Example
//!
//! ```
//! use meterlink_store::{RowQuery, Store};
//! use time::{Duration, OffsetDateTime};
//!
//! let store = Store::open_in_memory()?;
//! let yesterday = OffsetDateTime::now_utc() - Duration::hours(24);
//!
//! // Last day of one load profile, oldest first
//! let query = RowQuery::new()
//!     .device("MTR-0001")
//!     .profile("load_profile_1")
//!     .since(yesterday)
//!     .oldest_first();
//!
//! let rows = store.query_rows(&query)?;
//! # Ok::<(), meterlink_store::Error>(())
//! ```

use time::OffsetDateTime;

/// Fluent query builder for [`Store::query_rows`](crate::Store::query_rows).
///
/// By default, results are ordered by timestamp descending (newest first).
/// Time bounds are inclusive.
#[derive(Debug, Default, Clone)]
pub struct RowQuery {
    /// Filter by device serial.
    pub device_id: Option<String>,
    /// Filter by profile identifier.
    pub profile_id: Option<String>,
    /// Filter rows captured at or after this time.
    pub since: Option<OffsetDateTime>,
    /// Filter rows captured at or before this time.
    pub until: Option<OffsetDateTime>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
    /// Order by timestamp descending.
    pub newest_first: bool,
}

impl RowQuery {
    /// Create a query over all rows, newest first.
    pub fn new() -> Self {
        Self {
            newest_first: true,
            ..Default::default()
        }
    }

    /// Filter by device serial.
    #[must_use]
    pub fn device(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self
    }

    /// Filter by profile identifier.
    #[must_use]
    pub fn profile(mut self, profile_id: &str) -> Self {
        self.profile_id = Some(profile_id.to_string());
        self
    }

    /// Filter to rows captured at or after this time.
    #[must_use]
    pub fn since(mut self, time: OffsetDateTime) -> Self {
        self.since = Some(time);
        self
    }

    /// Filter to rows captured at or before this time.
    #[must_use]
    pub fn until(mut self, time: OffsetDateTime) -> Self {
        self.until = Some(time);
        self
    }

    /// Limit the number of results.
    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first N results.
    #[must_use]
    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Order chronologically.
    #[must_use]
    pub fn oldest_first(mut self) -> Self {
        self.newest_first = false;
        self
    }

    pub(crate) fn build_where(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref device_id) = self.device_id {
            conditions.push("device_id = ?");
            params.push(Box::new(device_id.clone()));
        }

        if let Some(ref profile_id) = self.profile_id {
            conditions.push("profile_id = ?");
            params.push(Box::new(profile_id.clone()));
        }

        if let Some(since) = self.since {
            conditions.push("timestamp >= ?");
            params.push(Box::new(since.unix_timestamp()));
        }

        if let Some(until) = self.until {
            conditions.push("timestamp <= ?");
            params.push(Box::new(until.unix_timestamp()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    pub(crate) fn build_sql(&self) -> String {
        let (where_clause, _) = self.build_where();
        let order = if self.newest_first { "DESC" } else { "ASC" };

        let mut sql = format!(
            "SELECT id, device_id, profile_id, timestamp, synced_at, row_values \
             FROM profile_rows {} ORDER BY timestamp {}, id {}",
            where_clause, order, order
        );

        // SQLite only accepts OFFSET after a LIMIT
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => {
                sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset))
            }
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            (None, None) => {}
        }

        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_row_query_new_defaults() {
        let query = RowQuery::new();
        assert!(query.device_id.is_none());
        assert!(query.profile_id.is_none());
        assert!(query.limit.is_none());
        assert!(query.newest_first);
        assert!(!RowQuery::default().newest_first);
    }

    #[test]
    fn test_row_query_chaining() {
        let since = datetime!(2024-01-01 00:00:00 UTC);
        let until = datetime!(2024-01-31 23:59:59 UTC);

        let query = RowQuery::new()
            .device("MTR-1")
            .profile("load_profile_1")
            .since(since)
            .until(until)
            .limit(10)
            .offset(5)
            .oldest_first();

        assert_eq!(query.device_id.as_deref(), Some("MTR-1"));
        assert_eq!(query.profile_id.as_deref(), Some("load_profile_1"));
        assert_eq!(query.since, Some(since));
        assert_eq!(query.until, Some(until));
        assert_eq!(query.limit, Some(10));
        assert_eq!(query.offset, Some(5));
        assert!(!query.newest_first);
    }

    #[test]
    fn test_build_where_empty() {
        let (where_clause, params) = RowQuery::new().build_where();
        assert_eq!(where_clause, "");
        assert!(params.is_empty());
    }

    #[test]
    fn test_build_where_all_filters() {
        let query = RowQuery::new()
            .device("MTR-1")
            .profile("daily_billing")
            .since(datetime!(2024-01-01 00:00:00 UTC))
            .until(datetime!(2024-02-01 00:00:00 UTC));
        let (where_clause, params) = query.build_where();

        assert_eq!(
            where_clause,
            "WHERE device_id = ? AND profile_id = ? AND timestamp >= ? AND timestamp <= ?"
        );
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_build_sql_ordering_and_paging() {
        let sql = RowQuery::new().build_sql();
        assert!(sql.contains("FROM profile_rows"));
        assert!(sql.contains("ORDER BY timestamp DESC"));
        assert!(!sql.contains("LIMIT"));

        let sql = RowQuery::new().oldest_first().limit(50).offset(100).build_sql();
        assert!(sql.contains("ORDER BY timestamp ASC"));
        assert!(sql.ends_with("LIMIT 50 OFFSET 100"));

        let sql = RowQuery::new().offset(20).build_sql();
        assert!(sql.ends_with("LIMIT -1 OFFSET 20"));
    }
}
