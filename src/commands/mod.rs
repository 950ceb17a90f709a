//! Line-oriented operator console.

mod config;
mod review;
mod view;

use anyhow::{anyhow, bail, Context as _, Result};
use chrono::{DateTime, NaiveDate, Utc};

use crate::state::AppState;
use crate::topics::types::{Momentum, Status, Verdict};
use crate::topics::{FilterSpec, Range};

pub const HELP: &str = "\
Commands:
  list                         show the current view
  show <id>                    full record of one topic in view
  filter [key=value ...]       switch the view; no arguments shows everything
      status=pending,approved  momentum=breaking  depth=2..4  viral=3..
      search=<text>  from=2025-01-01  to=2025-01-31  verdict=GO
      goldmine=7  first-mover=yes
  refresh                      reload the active filter
  draft <id> <commentary> [| #tag #tag ...]
  approve <id> <commentary> [| #tag #tag ...]
      a trailing ` | ` is read as hashtags only when every word after it
      starts with `#`; any other ` | ` stays in the commentary
  quick <id>                   approve with the saved commentary
  archive <id> | reject <id> | produce <id> | publish <id>
  stats | briefing
  config [param value]
  help | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    List,
    Show(String),
    Filter(FilterSpec),
    Refresh,
    Draft {
        id: String,
        commentary: String,
        hashtags: Vec<String>,
    },
    Approve {
        id: String,
        commentary: String,
        hashtags: Vec<String>,
    },
    QuickApprove(String),
    Archive(String),
    Reject(String),
    StartProduction(String),
    Publish(String),
    Stats,
    Briefing,
    Config(Option<(String, String)>),
    Help,
    Quit,
}

fn required_id(rest: &str, usage: &str) -> Result<String> {
    let id = rest.split_whitespace().next().ok_or_else(|| anyhow!("usage: {}", usage))?;
    Ok(id.to_string())
}

/// `<id> <commentary> [| #tag #tag ...]`. The text after the last ` | ` is
/// taken as hashtags only when every word in it starts with `#`; otherwise
/// the whole remainder is commentary, kept verbatim.
fn review_args(rest: &str, usage: &str) -> Result<(String, String, Vec<String>)> {
    let rest = rest.trim_start();
    let (id, body) = rest
        .split_once(char::is_whitespace)
        .ok_or_else(|| anyhow!("usage: {}", usage))?;
    let split = body.rsplit_once(" | ").filter(|(_, tags)| {
        let mut words = tags.split_whitespace().peekable();
        words.peek().is_some() && words.all(|w| w.starts_with('#') && w.len() > 1)
    });
    let (commentary, hashtags) = match split {
        Some((text, tags)) => (
            text,
            tags.split_whitespace()
                .map(|t| t.trim_start_matches('#').to_string())
                .collect(),
        ),
        None => (body, Vec::new()),
    };
    Ok((id.to_string(), commentary.to_string(), hashtags))
}

fn parse_list<T>(raw: &str, what: &str, parse: impl Fn(&str) -> Option<T>) -> Result<Vec<T>> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| parse(s.trim()).ok_or_else(|| anyhow!("unknown {} `{}`", what, s)))
        .collect()
}

fn parse_range(raw: &str) -> Result<Range> {
    let bound = |s: &str| -> Result<Option<f64>> {
        if s.is_empty() {
            return Ok(None);
        }
        let v: f64 = s.parse().with_context(|| format!("`{}` is not a number", s))?;
        Ok(Some(v))
    };
    match raw.split_once("..") {
        Some((lo, hi)) => Ok(Range {
            min: bound(lo)?,
            max: bound(hi)?,
        }),
        None => {
            let exact = bound(raw)?;
            Ok(Range {
                min: exact,
                max: exact,
            })
        }
    }
}

/// RFC 3339 timestamp or a bare date. Bare `to` dates include the whole day.
fn parse_time(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("`{}` is not a date", raw))?;
    let time = if end_of_day {
        date.and_hms_micro_opt(23, 59, 59, 999_999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .ok_or_else(|| anyhow!("`{}` is not a date", raw))
}

fn parse_filter(rest: &str) -> Result<FilterSpec> {
    let mut spec = FilterSpec::default();
    // `search=` swallows the remainder of the line.
    let (head, search) = match rest.find("search=") {
        Some(pos) => (&rest[..pos], Some(rest[pos + "search=".len()..].trim())),
        None => (rest, None),
    };
    spec.search = search.filter(|s| !s.is_empty()).map(str::to_string);

    for pair in head.split_whitespace() {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("expected key=value, got `{}`", pair))?;
        match key {
            "status" => spec.status = Some(parse_list(value, "status", Status::parse)?),
            "momentum" => spec.momentum = Some(parse_list(value, "momentum", Momentum::parse)?),
            "verdict" => spec.verdict = Some(parse_list(value, "verdict", Verdict::parse)?),
            "depth" => spec.technical_depth = parse_range(value)?,
            "viral" => spec.viral_potential = parse_range(value)?,
            "from" => spec.created_from = Some(parse_time(value, false)?),
            "to" => spec.created_to = Some(parse_time(value, true)?),
            "goldmine" => {
                spec.min_goldmine_score =
                    Some(value.parse().with_context(|| format!("`{}` is not a number", value))?)
            }
            "first-mover" => {
                spec.first_mover = Some(match value {
                    "yes" | "true" => true,
                    "no" | "false" => false,
                    _ => bail!("first-mover must be yes or no"),
                })
            }
            _ => bail!("unknown filter `{}`", key),
        }
    }
    Ok(spec)
}

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_start();
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .unwrap_or((line, ""));
        let cmd = match word.to_ascii_lowercase().as_str() {
            "list" | "ls" => Command::List,
            "show" => Command::Show(required_id(rest, "show <id>")?),
            "filter" => Command::Filter(parse_filter(rest)?),
            "refresh" => Command::Refresh,
            "draft" => {
                let (id, commentary, hashtags) = review_args(rest, "draft <id> <commentary>")?;
                Command::Draft {
                    id,
                    commentary,
                    hashtags,
                }
            }
            "approve" => {
                let (id, commentary, hashtags) = review_args(rest, "approve <id> <commentary>")?;
                Command::Approve {
                    id,
                    commentary,
                    hashtags,
                }
            }
            "quick" => Command::QuickApprove(required_id(rest, "quick <id>")?),
            "archive" => Command::Archive(required_id(rest, "archive <id>")?),
            "reject" => Command::Reject(required_id(rest, "reject <id>")?),
            "produce" => Command::StartProduction(required_id(rest, "produce <id>")?),
            "publish" => Command::Publish(required_id(rest, "publish <id>")?),
            "stats" => Command::Stats,
            "briefing" => Command::Briefing,
            "config" => {
                let mut parts = rest.split_whitespace();
                match (parts.next(), parts.next()) {
                    (None, _) => Command::Config(None),
                    (Some(key), Some(value)) => {
                        Command::Config(Some((key.to_string(), value.to_string())))
                    }
                    (Some(_), None) => bail!("provide both param and value, e.g. `config min_commentary_len 120`"),
                }
            }
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => bail!("unknown command `{}`; try `help`", other),
        };
        Ok(cmd)
    }
}

/// Runs one command and returns the text to print.
pub async fn dispatch(state: &AppState, command: Command) -> Result<String> {
    match command {
        Command::List => view::list(state).await,
        Command::Show(id) => view::show(state, &id).await,
        Command::Filter(spec) => view::filter(state, spec).await,
        Command::Refresh => view::refresh(state).await,
        Command::Stats => view::stats(state).await,
        Command::Briefing => view::briefing(state).await,
        Command::Draft {
            id,
            commentary,
            hashtags,
        } => review::draft(state, &id, commentary, hashtags).await,
        Command::Approve {
            id,
            commentary,
            hashtags,
        } => review::approve(state, &id, commentary, hashtags).await,
        Command::QuickApprove(id) => review::quick_approve(state, &id).await,
        Command::Archive(id) => review::archive(state, &id).await,
        Command::Reject(id) => review::reject(state, &id).await,
        Command::StartProduction(id) => review::start_production(state, &id).await,
        Command::Publish(id) => review::publish(state, &id).await,
        Command::Config(change) => config::config(state, change).await,
        Command::Help => Ok(HELP.to_string()),
        Command::Quit => Ok(String::new()),
    }
}
