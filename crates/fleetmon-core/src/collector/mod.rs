//! Per-instance collectors.
//!
//! Three collectors run against each live instance, each on its own
//! schedule, each holding a clone of the instance's pool handle:
//!
//! - `slow_query` — continuous process-list sampling with correlation
//! - `command_status` — daily command counter snapshot
//! - `disk_status` — periodic temp/binlog counter snapshot
//!
//! A failure against one instance never leaves its collector: polls and
//! counter reads are logged and retried on the next tick/schedule.

pub mod command_status;
pub mod disk_status;
pub mod slow_query;

use crate::db::{DbError, DbPool};
use crate::store::StoreError;

pub use command_status::CommandStatusCollector;
pub use disk_status::DiskStatusCollector;
pub use slow_query::SlowQueryCollector;

/// Error type for collector operations that must surface to the caller.
#[derive(Debug)]
pub enum CollectorError {
    Db(DbError),
    /// A persisted write failed; for finalized slow queries this is data
    /// loss and is logged at error level by the sampling loop.
    Store(StoreError),
}

impl std::fmt::Display for CollectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectorError::Db(e) => write!(f, "{}", e),
            CollectorError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CollectorError {}

/// Server uptime in seconds, from `SHOW GLOBAL STATUS LIKE 'Uptime'`.
pub(crate) async fn fetch_uptime<P: DbPool>(pool: &P) -> Result<i64, DbError> {
    let rows = pool.global_status("Uptime").await?;
    rows.iter()
        .find(|(name, _)| name == "Uptime")
        .and_then(|(_, value)| value.trim().parse::<i64>().ok())
        .ok_or_else(|| DbError::Query("server did not report Uptime".to_string()))
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Per-hour average over the server lifetime, clamping uptime to a minimum
/// of one hour so freshly restarted servers do not report inflated rates.
pub(crate) fn avg_for_hours(value: i64, uptime_secs: i64) -> f64 {
    round2(value as f64 / (uptime_secs as f64 / 3600.0).max(1.0))
}

/// Per-second average over the server lifetime, uptime clamped to 1s.
pub(crate) fn avg_for_seconds(value: i64, uptime_secs: i64) -> f64 {
    round2(value as f64 / (uptime_secs as f64).max(1.0))
}

/// Cleans a sampled statement for storage: comments stripped (outside
/// string literals), all whitespace runs collapsed to single spaces,
/// leading/trailing whitespace trimmed.
pub fn clean_statement(sql: &str) -> String {
    let stripped = strip_comments(sql);
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Removes `/* */`, `-- ` and `#` comments, leaving quoted literals alone.
fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == '\\' {
                // Escaped character inside a literal, including \' and \".
                if let Some(&next) = chars.peek() {
                    out.push(next);
                    chars.next();
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                out.push(c);
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c2 in chars.by_ref() {
                    if prev == '*' && c2 == '/' {
                        break;
                    }
                    prev = c2;
                }
                out.push(' ');
            }
            '#' => {
                for c2 in chars.by_ref() {
                    if c2 == '\n' {
                        break;
                    }
                }
                out.push(' ');
            }
            '-' if chars.peek() == Some(&'-') => {
                // "--" starts a comment only when followed by whitespace
                // or end of input.
                let mut lookahead = chars.clone();
                lookahead.next();
                let is_comment =
                    matches!(lookahead.peek(), None | Some(' ' | '\t' | '\n' | '\r'));
                if is_comment {
                    for c2 in chars.by_ref() {
                        if c2 == '\n' {
                            break;
                        }
                    }
                    out.push(' ');
                } else {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_collapses_whitespace() {
        assert_eq!(
            clean_statement("SELECT  *\n\tFROM   t\r\nWHERE id = 1"),
            "SELECT * FROM t WHERE id = 1"
        );
    }

    #[test]
    fn clean_strips_block_and_line_comments() {
        assert_eq!(
            clean_statement("SELECT /* hint */ * FROM t -- trailing\nWHERE a = 1 # note"),
            "SELECT * FROM t WHERE a = 1"
        );
    }

    #[test]
    fn clean_leaves_quoted_literals_alone() {
        assert_eq!(
            clean_statement("SELECT '/* keep */ -- this # too' FROM t"),
            "SELECT '/* keep */ -- this # too' FROM t"
        );
        // Double dash without a following space is an expression.
        assert_eq!(clean_statement("SELECT 1--2"), "SELECT 1--2");
    }

    #[test]
    fn clean_handles_escaped_quotes() {
        assert_eq!(
            clean_statement(r"SELECT 'it\'s /* fine */' FROM t"),
            r"SELECT 'it\'s /* fine */' FROM t"
        );
    }

    #[test]
    fn averages_clamp_short_uptime() {
        // Less than an hour of uptime counts as one full hour.
        assert_eq!(avg_for_hours(100, 200), 100.0);
        assert_eq!(avg_for_seconds(100, 200), 0.5);
        // Long-lived server: plain division, rounded to 2 decimals.
        assert_eq!(avg_for_hours(100, 7200), 50.0);
        assert_eq!(avg_for_seconds(1, 3), 0.33);
    }

    #[test]
    fn averages_survive_zero_uptime() {
        assert_eq!(avg_for_hours(10, 0), 10.0);
        assert_eq!(avg_for_seconds(10, 0), 10.0);
    }
}
