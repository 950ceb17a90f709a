use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{RequestBuilder, Response};
use tracing::{debug, info, warn};

use super::{ensure_mutable, FeedError, RawFeed, RemoteError, RemoteStore, TableScope};
use crate::sync::feed::decode_line;
use crate::topics::filter::{Constraint, Operand};
use crate::topics::types::{ChangeEvent, PartialRecord, Precondition, Topic};
use crate::topics::RemoteQuery;

/// Topic table served over PostgREST, with changes read from a streaming
/// relay endpoint.
pub struct PostgrestStore {
    client: reqwest::Client,
    base_url: String,
    feed_url: String,
    api_key: String,
}

impl PostgrestStore {
    pub fn new(base_url: &str, api_key: &str, feed_url: Option<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let feed_url = feed_url.unwrap_or_else(|| format!("{}/changes/v1/topics", base_url));
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url,
            feed_url,
            api_key: api_key.to_string(),
        })
    }

    /// `None` when `SUPABASE_URL` is not configured.
    pub fn from_env() -> Result<Option<Self>> {
        let Ok(base_url) = dotenv::var("SUPABASE_URL") else {
            return Ok(None);
        };
        let api_key = dotenv::var("SUPABASE_ANON_KEY").context("SUPABASE_ANON_KEY required")?;
        let feed_url = dotenv::var("TOPIC_FEED_URL").ok().filter(|u| !u.is_empty());
        let timeout_secs = dotenv::var("REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(30);
        Self::new(&base_url, &api_key, feed_url, Duration::from_secs(timeout_secs)).map(Some)
    }

    fn table_url(&self, scope: &TableScope) -> String {
        format!("{}/rest/v1/{}", self.base_url, scope.name())
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }
}

/// Quotes a value when it contains PostgREST list or filter syntax.
fn quote(value: &str) -> String {
    if value.contains([',', '(', ')', '"', '\\', ':']) || value.contains(' ') {
        format!("\"{}\"", escape_quoted(value))
    } else {
        value.to_string()
    }
}

/// Backslash escaping for a double-quoted PostgREST value.
fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Makes LIKE wildcards in a search term literal.
fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn render_list(values: &[Operand]) -> String {
    let items: Vec<String> = values.iter().map(|v| quote(&v.render())).collect();
    format!("({})", items.join(","))
}

/// Query string pairs for one query. Keys may repeat (range bounds).
pub fn query_params(query: &RemoteQuery) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    for constraint in &query.constraints {
        let pair = match constraint {
            Constraint::Eq(col, v) => (col.name().to_string(), format!("eq.{}", quote(&v.render()))),
            Constraint::In(col, set) => (col.name().to_string(), format!("in.{}", render_list(set))),
            Constraint::Gte(col, v) => (col.name().to_string(), format!("gte.{}", v.render())),
            Constraint::Lte(col, v) => (col.name().to_string(), format!("lte.{}", v.render())),
            Constraint::Contains { columns, needle } => {
                let pattern = format!("*{}*", escape_quoted(&escape_like(needle)));
                let arms: Vec<String> = columns
                    .iter()
                    .map(|c| format!("{}.ilike.\"{}\"", c.name(), pattern))
                    .collect();
                ("or".to_string(), format!("({})", arms.join(",")))
            }
        };
        params.push(pair);
    }
    let direction = if query.order.descending { "desc" } else { "asc" };
    params.push((
        "order".to_string(),
        format!("{}.{}", query.order.column.name(), direction),
    ));
    params
}

/// Row filter for a conditional PATCH.
pub fn write_params(id: &str, precondition: &Precondition) -> Vec<(String, String)> {
    let mut params = vec![("id".to_string(), format!("eq.{}", quote(id)))];
    if let Some(at) = precondition.updated_at {
        params.push((
            "updated_at".to_string(),
            format!("eq.{}", Operand::Time(at).render()),
        ));
    }
    if let Some(statuses) = &precondition.status_in {
        let set: Vec<Operand> = statuses.iter().map(|s| Operand::text(s.as_str())).collect();
        params.push(("status".to_string(), format!("in.{}", render_list(&set))));
    }
    params
}

async fn check_status(resp: Response) -> Result<Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        code: status.as_u16(),
        body,
    })
}

fn transport(err: reqwest::Error) -> RemoteError {
    RemoteError::Transport(err.to_string())
}

#[async_trait]
impl RemoteStore for PostgrestStore {
    async fn query(&self, scope: &TableScope, query: &RemoteQuery) -> Result<Vec<Topic>, RemoteError> {
        let params = query_params(query);
        debug!(table = %scope, ?params, "postgrest query");
        let resp = self
            .authorized(self.client.get(self.table_url(scope)))
            .query(&params)
            .send()
            .await
            .map_err(transport)?;
        let resp = check_status(resp).await?;
        let text = resp.text().await.map_err(transport)?;
        serde_json::from_str(&text).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn write(
        &self,
        scope: &TableScope,
        id: &str,
        record: &PartialRecord,
        precondition: &Precondition,
    ) -> Result<(), RemoteError> {
        ensure_mutable(record)?;
        let resp = self
            .authorized(self.client.patch(self.table_url(scope)))
            .query(&write_params(id, precondition))
            .header("Prefer", "return=representation")
            .json(record)
            .send()
            .await
            .map_err(transport)?;
        let resp = check_status(resp).await?;
        let text = resp.text().await.map_err(transport)?;
        let rows: Vec<serde_json::Value> =
            serde_json::from_str(&text).map_err(|e| RemoteError::Decode(e.to_string()))?;
        if rows.is_empty() {
            if precondition.is_empty() {
                return Err(RemoteError::NotFound(id.to_string()));
            }
            // Nothing matched: either the row is gone or it moved on.
            let exists = !self.query(scope, &RemoteQuery::by_id(id)).await?.is_empty();
            return Err(if exists {
                RemoteError::Conflict(id.to_string())
            } else {
                RemoteError::NotFound(id.to_string())
            });
        }
        debug!(table = %scope, topic_id = id, "postgrest write applied");
        Ok(())
    }

    async fn subscribe_changes(&self, scope: &TableScope) -> Result<RawFeed, FeedError> {
        let resp = self
            .authorized(self.client.get(&self.feed_url))
            .query(&[("table", scope.name())])
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(FeedError::Connect(format!("relay returned {}", resp.status())));
        }
        info!(url = %self.feed_url, table = %scope, "change relay connected");
        Ok(relay_events(resp))
    }
}

/// Splits a byte stream into text lines across chunk boundaries.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
        }
        lines
    }
}

struct RelayState {
    bytes: futures::stream::BoxStream<'static, reqwest::Result<Vec<u8>>>,
    lines: LineBuffer,
    ready: VecDeque<Result<ChangeEvent, FeedError>>,
    ended: bool,
}

fn relay_events(resp: Response) -> RawFeed {
    let state = RelayState {
        bytes: resp.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
        lines: LineBuffer::default(),
        ready: VecDeque::new(),
        ended: false,
    };
    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.ready.pop_front() {
                return Some((item, st));
            }
            if st.ended {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    for line in st.lines.push(&chunk) {
                        if let Some(event) = decode_line(&line) {
                            st.ready.push_back(event);
                        }
                    }
                }
                Some(Err(err)) => {
                    warn!(error = %err, "change relay read failed");
                    st.ready.push_back(Err(FeedError::Disconnected(err.to_string())));
                    st.ended = true;
                }
                None => {
                    st.ready
                        .push_back(Err(FeedError::Disconnected("relay closed the stream".into())));
                    st.ended = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::types::{Momentum, Status};
    use crate::topics::{FilterSpec, Range};

    fn value_of<'a>(params: &'a [(String, String)], key: &str) -> Vec<&'a str> {
        params
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    #[test]
    fn test_params_for_pending_view() {
        let params = query_params(&FilterSpec::with_status(&[Status::Pending]).compile());
        assert_eq!(value_of(&params, "select"), vec!["*"]);
        assert_eq!(value_of(&params, "status"), vec!["in.(pending)"]);
        assert_eq!(value_of(&params, "order"), vec!["created_at.desc"]);
    }

    #[test]
    fn test_params_for_ranges_and_search() {
        let spec = FilterSpec {
            momentum: Some(vec![Momentum::Breaking, Momentum::Peaking]),
            technical_depth: Range::between(2.0, 4.0),
            search: Some("rust, async".into()),
            ..FilterSpec::default()
        };
        let params = query_params(&spec.compile());
        assert_eq!(value_of(&params, "momentum"), vec!["in.(breaking,peaking)"]);
        assert_eq!(value_of(&params, "technical_depth"), vec!["gte.2", "lte.4"]);
        assert_eq!(
            value_of(&params, "or"),
            vec![r#"(title.ilike."*rust, async*",summary.ilike."*rust, async*")"#]
        );
    }

    #[test]
    fn test_by_id_quotes_odd_ids() {
        let params = query_params(&RemoteQuery::by_id("a,b"));
        assert_eq!(value_of(&params, "id"), vec![r#"eq."a,b""#]);
        assert_eq!(quote("plain-id"), "plain-id");
    }

    #[test]
    fn test_search_escapes_like_wildcards() {
        let spec = FilterSpec {
            search: Some("gpt_4".into()),
            ..FilterSpec::default()
        };
        let params = query_params(&spec.compile());
        assert_eq!(
            value_of(&params, "or"),
            vec![r#"(title.ilike."*gpt\\_4*",summary.ilike."*gpt\\_4*")"#]
        );

        let spec = FilterSpec {
            search: Some("50%".into()),
            ..FilterSpec::default()
        };
        let params = query_params(&spec.compile());
        assert_eq!(
            value_of(&params, "or"),
            vec![r#"(title.ilike."*50\\%*",summary.ilike."*50\\%*")"#]
        );
        assert_eq!(escape_like(r"a\b"), r"a\\b");
    }

    #[test]
    fn test_write_params_carry_precondition() {
        use crate::topics::types::fixtures::at;

        assert_eq!(
            write_params("t-1", &Precondition::default()),
            vec![("id".to_string(), "eq.t-1".to_string())]
        );
        let params = write_params(
            "t-1",
            &Precondition {
                updated_at: Some(at(0)),
                status_in: Some(vec![Status::Pending, Status::PendingReview]),
            },
        );
        assert_eq!(value_of(&params, "updated_at"), vec!["eq.2025-01-01T00:00:00.000000Z"]);
        assert_eq!(value_of(&params, "status"), vec!["in.(pending,pending_review)"]);
    }

    #[test]
    fn test_line_buffer_joins_chunks() {
        let mut lines = LineBuffer::default();
        assert!(lines.push(b"data: {\"a\"").is_empty());
        assert_eq!(lines.push(b":1}\r\n\n: ping\n"), vec!["data: {\"a\":1}", "", ": ping"]);
        assert!(lines.push(b"tail").is_empty());
    }
}
