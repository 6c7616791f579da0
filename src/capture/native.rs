// Native capture format
//
//   [ { "tool": "proxy", "listenerPort": 8080,
//       "request":  { "method": "GET", "url": "https://...", "headers": [...], "body": "..." },
//       "response": { "status": 200, "reason": "OK", "headers": [...], "bodyBase64": "..." } } ]
//
// The top level may also be `{ "exchanges": [...] }`. Headers are either
// `"Name: value"` lines or `{ "name": ..., "value": ... }` objects.

use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;

use super::CaptureParser;
use crate::error::{Error, Result};
use crate::models::{CapturedExchange, Header, HttpRequest, HttpResponse, Method, ToolKind};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CaptureFile {
    List(Vec<ExchangeRecord>),
    Wrapped { exchanges: Vec<ExchangeRecord> },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeRecord {
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    listener_port: Option<u16>,
    request: RequestRecord,
    #[serde(default)]
    response: Option<ResponseRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestRecord {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    headers: Vec<HeaderRecord>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    body_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseRecord {
    status: u16,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    headers: Vec<HeaderRecord>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    body_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HeaderRecord {
    Line(String),
    Pair { name: String, value: String },
}

fn default_method() -> String {
    "GET".to_string()
}

impl HeaderRecord {
    fn into_header(self) -> Option<Header> {
        match self {
            HeaderRecord::Line(line) => Header::parse_line(&line),
            HeaderRecord::Pair { name, value } => Some(Header::new(name, value)),
        }
    }
}

fn body_bytes(body: Option<String>, body_base64: Option<String>, context: &str) -> Result<Vec<u8>> {
    match (body_base64, body) {
        (Some(encoded), _) => general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Capture(format!("{}: invalid bodyBase64: {}", context, e))),
        (None, Some(text)) => Ok(text.into_bytes()),
        (None, None) => Ok(Vec::new()),
    }
}

fn headers(records: Vec<HeaderRecord>) -> Vec<Header> {
    records.into_iter().filter_map(HeaderRecord::into_header).collect()
}

fn to_exchange(record: ExchangeRecord, context: &str) -> Result<CapturedExchange> {
    let req = record.request;
    let mut request = HttpRequest::from_url(Method::from(req.method.as_str()), &req.url)
        .map_err(|e| Error::Capture(format!("{}: bad URL '{}': {}", context, req.url, e)))?;
    request.headers = headers(req.headers);
    request.body = body_bytes(req.body, req.body_base64, context)?;

    let response = match record.response {
        Some(res) => {
            let mut response = HttpResponse::new(res.status);
            if let Some(reason) = res.reason {
                response.reason = reason;
            }
            response.headers = headers(res.headers);
            response.body = body_bytes(res.body, res.body_base64, context)?;
            Some(response)
        }
        None => None,
    };

    let mut exchange = CapturedExchange::new(request, response);
    exchange.tool = record.tool.as_deref().map_or(ToolKind::Proxy, ToolKind::from_name);
    exchange.listener_port = record.listener_port;
    Ok(exchange)
}

/// Parse native capture JSON text.
pub fn parse_str(json: &str, context: &str) -> Result<Vec<CapturedExchange>> {
    let file: CaptureFile =
        serde_json::from_str(json).map_err(|e| Error::Capture(format!("{}: {}", context, e)))?;
    let records = match file {
        CaptureFile::List(records) => records,
        CaptureFile::Wrapped { exchanges } => exchanges,
    };
    records
        .into_iter()
        .enumerate()
        .map(|(i, record)| to_exchange(record, &format!("{} #{}", context, i + 1)))
        .collect()
}

pub struct NativeParser;

impl CaptureParser for NativeParser {
    fn parse(&self, path: &Path) -> Result<Vec<CapturedExchange>> {
        let json = std::fs::read_to_string(path)?;
        parse_str(&json, &path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_header_shapes_and_bodies() {
        let json = r#"{"exchanges": [{
            "tool": "repeater",
            "listenerPort": 8081,
            "request": {
                "method": "post",
                "url": "https://app.test/api/orders?id=4",
                "headers": ["Cookie: sid=1", {"name": "Content-Type", "value": "application/json"}],
                "body": "{\"id\":4}"
            },
            "response": {"status": 200, "headers": ["Content-Type: application/json"], "bodyBase64": "b2s="}
        }]}"#;
        let exchanges = parse_str(json, "test").unwrap();
        let exchange = &exchanges[0];
        assert_eq!(exchange.tool, ToolKind::Repeater);
        assert_eq!(exchange.listener_port, Some(8081));
        assert_eq!(exchange.request.method, Method::POST);
        assert_eq!(exchange.request.target, "/api/orders?id=4");
        assert_eq!(exchange.request.header("cookie"), Some("sid=1"));
        assert_eq!(exchange.request.header("content-type"), Some("application/json"));
        assert_eq!(exchange.response.as_ref().unwrap().body, b"ok".to_vec());
    }

    #[test]
    fn response_is_optional() {
        let json = r#"[{"request": {"url": "http://localhost:3000/"}}]"#;
        let exchanges = parse_str(json, "test").unwrap();
        assert_eq!(exchanges[0].request.method, Method::GET);
        assert!(exchanges[0].response.is_none());
    }

    #[test]
    fn bad_url_is_reported_with_position() {
        let err = parse_str(r#"[{"request": {"url": "/relative"}}]"#, "caps.json").unwrap_err();
        assert!(err.to_string().contains("caps.json #1"));
    }
}
