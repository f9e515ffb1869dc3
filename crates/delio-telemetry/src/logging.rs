use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A warn+ log record persisted for operator review.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub user_id: Option<i64>,
    pub trace_id: Option<String>,
    pub state: Option<String>,
}

/// Query parameters for searching persisted logs.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub user_id: Option<i64>,
    pub trace_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink for warn+ kernel logs, indexed by user and cycle.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS kernel_logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 user_id INTEGER,
                 trace_id TEXT,
                 state TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_kernel_logs_user ON kernel_logs(user_id, timestamp);
             CREATE INDEX IF NOT EXISTS idx_kernel_logs_trace ON kernel_logs(trace_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO kernel_logs
                 (timestamp, level, target, message, fields, user_id, trace_id, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.user_id,
                record.trace_id,
                record.state,
            ],
        );
    }

    /// Most recent matching records first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, user_id, trace_id, state
             FROM kernel_logs WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(level) = &q.level {
            sql.push_str(&format!(" AND level = ?{}", params.len() + 1));
            params.push(Box::new(level.to_uppercase()));
        }
        if let Some(user_id) = q.user_id {
            sql.push_str(&format!(" AND user_id = ?{}", params.len() + 1));
            params.push(Box::new(user_id));
        }
        if let Some(trace_id) = &q.trace_id {
            sql.push_str(&format!(" AND trace_id = ?{}", params.len() + 1));
            params.push(Box::new(trace_id.clone()));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }

        sql.push_str(" ORDER BY id DESC");
        sql.push_str(&format!(" LIMIT {}", q.limit.unwrap_or(100)));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                user_id: row.get(6)?,
                trace_id: row.get(7)?,
                state: row.get(8)?,
            })
        })?;

        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM kernel_logs", [], |row| row.get(0))
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    user_id: Option<i64>,
    trace_id: Option<String>,
    state: Option<String>,
}

/// tracing Layer that writes warn+ events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Correlation fields lifted out of events and spans.
#[derive(Clone, Default)]
struct Correlation {
    user_id: Option<i64>,
    trace_id: Option<String>,
    state: Option<String>,
}

impl Correlation {
    fn fill_from(&mut self, other: &Correlation) {
        if self.user_id.is_none() {
            self.user_id = other.user_id;
        }
        if self.trace_id.is_none() {
            self.trace_id.clone_from(&other.trace_id);
        }
        if self.state.is_none() {
            self.state.clone_from(&other.state);
        }
    }

    fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.trace_id.is_none() && self.state.is_none()
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    correlation: Correlation,
}

impl FieldVisitor {
    fn record_text(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            "user_id" => self.correlation.user_id = value.parse().ok(),
            "trace_id" => self.correlation.trace_id = Some(value),
            "state" => self.correlation.state = Some(value),
            name => {
                self.fields.insert(name.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{:?}", value);
        let val = val.trim_matches('"').to_string();
        self.record_text(field, val);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_text(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == "user_id" {
            self.correlation.user_id = Some(value);
            return;
        }
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "user_id" {
            self.correlation.user_id = i64::try_from(value).ok();
            return;
        }
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(correlation) = span.extensions().get::<Correlation>() {
                    visitor.correlation.fill_from(correlation);
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            user_id: visitor.correlation.user_id,
            trace_id: visitor.correlation.trace_id,
            state: visitor.correlation.state,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if !visitor.correlation.is_empty() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(visitor.correlation);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn record(
        level: &str,
        message: &str,
        user_id: Option<i64>,
        trace_id: Option<&str>,
    ) -> LogInsert {
        LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.into(),
            target: "delio_kernel::guard".into(),
            message: message.into(),
            fields: None,
            user_id,
            trace_id: trace_id.map(str::to_string),
            state: None,
        }
    }

    #[test]
    fn file_sink_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteLogSink::new(&dir.path().join("nested/logs.db")).unwrap();
        sink.insert(&record("WARN", "slow", None, None));
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn query_by_user_and_level() {
        let sink = SqliteLogSink::in_memory().unwrap();
        sink.insert(&record("WARN", "lock contention", Some(1), None));
        sink.insert(&record("ERROR", "illegal transition", Some(1), None));
        sink.insert(&record("ERROR", "illegal transition", Some(2), None));

        let results = sink
            .query(&LogQuery {
                level: Some("error".into()),
                user_id: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].user_id, Some(1));
        assert_eq!(results[0].level, "ERROR");
    }

    #[test]
    fn query_by_trace_most_recent_first() {
        let sink = SqliteLogSink::in_memory().unwrap();
        for i in 0..5 {
            sink.insert(&record("WARN", &format!("msg {i}"), Some(3), Some("trace_a")));
        }
        sink.insert(&record("WARN", "other", Some(3), Some("trace_b")));

        let results = sink
            .query(&LogQuery {
                trace_id: Some("trace_a".into()),
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].message, "msg 4");
    }

    #[test]
    fn layer_persists_warnings_with_span_correlation() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("cycle", user_id = 42_i64, trace_id = "trace_x");
            let _entered = span.enter();
            tracing::info!("not persisted");
            tracing::warn!(state = "PLAN", "deadline close");
        });

        let results = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "deadline close");
        assert_eq!(results[0].user_id, Some(42));
        assert_eq!(results[0].trace_id.as_deref(), Some("trace_x"));
        assert_eq!(results[0].state.as_deref(), Some("PLAN"));
    }
}
