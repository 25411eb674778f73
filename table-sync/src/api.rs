//! Remote call surface of a ledger node.
//!
//! The transport itself lives outside this crate; it plugs in through
//! [`RemoteApi`]. This module defines the request and reply shapes the engine
//! speaks over it.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Transport-level failure of one call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkFailure {
    #[error("http status {0}")]
    Http(u16),
    #[error("unknown protocol")]
    ProtocolUnknown,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

impl NetworkFailure {
    /// Code reported to the user: the HTTP status, -1 for an unknown
    /// protocol, -2 for a refused connection, 0 for anything else.
    pub fn code(&self) -> i32 {
        match self {
            NetworkFailure::Http(status) => *status as i32,
            NetworkFailure::ProtocolUnknown => -1,
            NetworkFailure::ConnectionRefused => -2,
            NetworkFailure::Timeout | NetworkFailure::Other(_) => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    GetInfo,
    GetTableRows,
    GetBlock,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::GetInfo => "/v1/chain/get_info",
            Endpoint::GetTableRows => "/v1/chain/get_table_rows",
            Endpoint::GetBlock => "/v1/chain/get_block",
        }
    }
}

/// One asynchronous call to a node. Implementations decide how the request
/// travels; the engine only awaits the reply.
#[async_trait(?Send)]
pub trait RemoteApi {
    async fn call(&self, node: &Url, endpoint: Endpoint, payload: Value) -> Result<Value, NetworkFailure>;
}

/// Parameters of a get-table-rows call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetTableRows {
    pub code: String,
    pub table: String,
    pub scope: String,
    pub json: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_bound: Option<Value>,
    pub limit: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reverse: bool,
}

impl GetTableRows {
    pub fn new(code: &str, table: &str, scope: &str, limit: u32) -> Self {
        Self {
            code: code.to_string(),
            table: table.to_string(),
            scope: scope.to_string(),
            json: true,
            lower_bound: None,
            limit,
            reverse: false,
        }
    }

    pub fn from(mut self, lower_bound: Value) -> Self {
        self.lower_bound = Some(lower_bound);
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A sanity-checked get-table-rows reply.
#[derive(Debug, Clone, PartialEq)]
pub struct RowsPage {
    pub rows: Vec<Value>,
    /// Where the next page starts, present only when the node said there is
    /// more.
    pub next_key: Option<Value>,
}

/// Check a get-table-rows reply. `None` when the reply is not an object with a
/// `rows` array.
pub fn parse_rows(reply: &Value) -> Option<RowsPage> {
    let object = reply.as_object()?;
    let rows = object.get("rows")?.as_array()?.clone();
    let more = object.get("more").map_or(false, |m| match m {
        Value::Bool(b) => *b,
        // older nodes send the next key in `more`
        Value::String(s) => !s.is_empty(),
        _ => false,
    });
    let next_key = if more {
        object.get("next_key").filter(|k| !k.is_null() && *k != &Value::String(String::new())).cloned()
    } else {
        None
    };
    Some(RowsPage { rows, next_key })
}

/// Head-of-chain summary returned by get-info.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChainInfo {
    #[serde(default)]
    pub chain_id: String,
    pub head_block_id: String,
    #[serde(default, deserialize_with = "u64_or_string")]
    pub head_block_num: u64,
    #[serde(default, deserialize_with = "u64_or_string")]
    pub last_irreversible_block_num: u64,
    #[serde(default, deserialize_with = "optional_ledger_time")]
    pub head_block_time: Option<DateTime<Utc>>,
}

/// Accept a 64-bit integer written either as a JSON number or as a decimal
/// string, the way nodes emit large integers.
pub fn u64_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Parse a ledger timestamp: ISO-8601 without zone, optionally fractional,
/// always UTC.
pub fn parse_ledger_time(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn ledger_time<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let text = String::deserialize(deserializer)?;
    parse_ledger_time(&text).ok_or_else(|| serde::de::Error::custom(format!("bad ledger time {text}")))
}

fn optional_ledger_time<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    let text = Option::<String>::deserialize(deserializer)?;
    Ok(text.as_deref().and_then(parse_ledger_time))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_payload_shape() {
        let request = GetTableRows::new("fmv", "groups", "123", 1).from(json!(5));
        assert_eq!(
            request.to_payload(),
            json!({"code": "fmv", "table": "groups", "scope": "123", "json": true, "lower_bound": 5, "limit": 1})
        );
        let journal = GetTableRows::new("fmv", "journal", "global", 1).reversed();
        assert_eq!(journal.to_payload()["reverse"], json!(true));
        assert!(journal.to_payload().get("lower_bound").is_none());
    }

    #[test]
    fn test_parse_rows_next_key_only_with_more() {
        let page = parse_rows(&json!({"rows": [{"id": 1}], "more": true, "next_key": "2"})).unwrap();
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.next_key, Some(json!("2")));

        let page = parse_rows(&json!({"rows": [], "more": false, "next_key": "2"})).unwrap();
        assert_eq!(page.next_key, None);

        assert!(parse_rows(&json!({"rows": {}})).is_none());
        assert!(parse_rows(&json!("nonsense")).is_none());
    }

    #[test]
    fn test_chain_info_accepts_string_numbers() {
        let info: ChainInfo = serde_json::from_value(json!({
            "chain_id": "abc",
            "head_block_id": "00ff",
            "head_block_num": "255",
            "last_irreversible_block_num": 250,
            "head_block_time": "2021-03-04T05:06:07.500"
        }))
        .unwrap();
        assert_eq!(info.head_block_num, 255);
        assert_eq!(info.last_irreversible_block_num, 250);
        assert_eq!(info.head_block_time.unwrap().timestamp_millis(), 1614834367500);
    }

    #[test]
    fn test_failure_codes() {
        assert_eq!(NetworkFailure::Http(503).code(), 503);
        assert_eq!(NetworkFailure::ProtocolUnknown.code(), -1);
        assert_eq!(NetworkFailure::ConnectionRefused.code(), -2);
        assert_eq!(NetworkFailure::Timeout.code(), 0);
    }
}
