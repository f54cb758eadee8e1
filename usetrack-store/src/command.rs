//! # Store Command Model
//!
//! Purpose: Describe the small Redis-compatible command subset the Storage
//! Adapters need, independently of how a transport executes it.
//!
//! ## Design Principles
//!
//! 1. **Typed Requests**: Adapters build [`Command`] values, never raw strings.
//! 2. **Wire Fidelity**: [`Command::to_args`] yields exactly the RESP argument
//!    vector a Redis-compatible server expects, and the in-memory store answers
//!    with the same [`Reply`] shapes.
//! 3. **Integer Scores**: Hit counts and timestamps are whole numbers; replies
//!    carrying floating-point scores are narrowed at the edge.

use usetrack_common::{UsetrackError, UsetrackResult};

/// Update condition for `ZADD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZAddCondition {
    /// Only lower existing scores (`LT`); new members are added.
    LessThan,
    /// Only raise existing scores (`GT`); new members are added.
    GreaterThan,
}

/// A single store command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Select(u32),
    ZIncrBy {
        key: String,
        member: String,
        delta: u64,
    },
    ZAdd {
        key: String,
        condition: ZAddCondition,
        entries: Vec<(u64, String)>,
    },
    /// Inclusive range by descending score; negative indexes count from the end.
    ZRevRangeWithScores {
        key: String,
        start: i64,
        stop: i64,
    },
    ZMScore {
        key: String,
        members: Vec<String>,
    },
    ZCard {
        key: String,
    },
    HIncrBy {
        key: String,
        field: String,
        delta: u64,
    },
    HGetAll {
        key: String,
    },
    HScan {
        key: String,
        cursor: u64,
        count: usize,
    },
    HLen {
        key: String,
    },
    Del {
        keys: Vec<String>,
    },
}

impl Command {
    /// Returns the RESP argument vector for this command.
    pub fn to_args(&self) -> Vec<Vec<u8>> {
        fn arg(s: impl ToString) -> Vec<u8> {
            s.to_string().into_bytes()
        }

        match self {
            Command::Ping => vec![arg("PING")],
            Command::Select(db) => vec![arg("SELECT"), arg(db)],
            Command::ZIncrBy { key, member, delta } => {
                vec![arg("ZINCRBY"), arg(key), arg(delta), arg(member)]
            }
            Command::ZAdd {
                key,
                condition,
                entries,
            } => {
                let flag = match condition {
                    ZAddCondition::LessThan => "LT",
                    ZAddCondition::GreaterThan => "GT",
                };
                let mut args = Vec::with_capacity(3 + entries.len() * 2);
                args.push(arg("ZADD"));
                args.push(arg(key));
                args.push(arg(flag));
                for (score, member) in entries {
                    args.push(arg(score));
                    args.push(arg(member));
                }
                args
            }
            Command::ZRevRangeWithScores { key, start, stop } => vec![
                arg("ZREVRANGE"),
                arg(key),
                arg(start),
                arg(stop),
                arg("WITHSCORES"),
            ],
            Command::ZMScore { key, members } => {
                let mut args = Vec::with_capacity(2 + members.len());
                args.push(arg("ZMSCORE"));
                args.push(arg(key));
                args.extend(members.iter().map(arg));
                args
            }
            Command::ZCard { key } => vec![arg("ZCARD"), arg(key)],
            Command::HIncrBy { key, field, delta } => {
                vec![arg("HINCRBY"), arg(key), arg(field), arg(delta)]
            }
            Command::HGetAll { key } => vec![arg("HGETALL"), arg(key)],
            Command::HScan { key, cursor, count } => vec![
                arg("HSCAN"),
                arg(key),
                arg(cursor),
                arg("COUNT"),
                arg(count),
            ],
            Command::HLen { key } => vec![arg("HLEN"), arg(key)],
            Command::Del { keys } => {
                let mut args = Vec::with_capacity(1 + keys.len());
                args.push(arg("DEL"));
                args.extend(keys.iter().map(arg));
                args
            }
        }
    }
}

/// A RESP2 reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    pub fn bulk(value: impl Into<Vec<u8>>) -> Self {
        Reply::Bulk(Some(value.into()))
    }

    /// Converts a server-side error reply into [`UsetrackError::Rejected`].
    pub fn check(self) -> UsetrackResult<Reply> {
        match self {
            Reply::Error(message) => Err(UsetrackError::Rejected(message)),
            other => Ok(other),
        }
    }

    pub fn into_integer(self) -> UsetrackResult<i64> {
        match self.check()? {
            Reply::Integer(n) => Ok(n),
            other => Err(unexpected("integer", &other)),
        }
    }

    /// Returns the items of an array reply; a nil array is empty.
    pub fn into_array(self) -> UsetrackResult<Vec<Reply>> {
        match self.check()? {
            Reply::Array(items) => Ok(items.unwrap_or_default()),
            other => Err(unexpected("array", &other)),
        }
    }

    /// Returns a bulk string as UTF-8; nil is an error.
    pub fn into_string(self) -> UsetrackResult<String> {
        match self.check()? {
            Reply::Bulk(Some(bytes)) => String::from_utf8(bytes)
                .map_err(|_| UsetrackError::ProtocolViolation("non UTF-8 bulk string".into())),
            Reply::Status(s) => Ok(s),
            other => Err(unexpected("bulk string", &other)),
        }
    }

    /// Interprets a bulk string or integer as a whole-number score.
    ///
    /// Returns `None` for nil, which `ZMSCORE` uses for missing members.
    pub fn into_score(self) -> UsetrackResult<Option<u64>> {
        match self.check()? {
            Reply::Bulk(None) => Ok(None),
            Reply::Integer(n) => Ok(Some(n.max(0) as u64)),
            other => {
                let text = other.into_string()?;
                parse_score(&text).map(Some)
            }
        }
    }
}

/// Parses a Redis score string (`"5"`, `"5.0"`, `"1.7e9"`) into a u64.
pub fn parse_score(text: &str) -> UsetrackResult<u64> {
    if let Ok(n) = text.parse::<u64>() {
        return Ok(n);
    }
    let value: f64 = text
        .parse()
        .map_err(|_| UsetrackError::ProtocolViolation(format!("invalid score `{text}`")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(UsetrackError::ProtocolViolation(format!(
            "score `{text}` out of range"
        )));
    }
    Ok(value.round() as u64)
}

fn unexpected(expected: &str, got: &Reply) -> UsetrackError {
    UsetrackError::ProtocolViolation(format!("expected {expected}, got {got:?}"))
}

/// Splits a flat `[name, score, name, score, ...]` array into pairs.
pub fn into_pairs(items: Vec<Reply>) -> UsetrackResult<Vec<(String, u64)>> {
    if items.len() % 2 != 0 {
        return Err(UsetrackError::ProtocolViolation(
            "odd number of elements in pair array".into(),
        ));
    }
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(name), Some(score)) = (iter.next(), iter.next()) {
        let name = name.into_string()?;
        let score = score
            .into_score()?
            .ok_or_else(|| UsetrackError::ProtocolViolation("nil score in pair".into()))?;
        pairs.push((name, score));
    }
    Ok(pairs)
}
