// HTTP Archive (HAR 1.2) parser
// Walks `log.entries[]` with serde_json. HTTP/2 pseudo-headers are skipped and
// a response status of 0 means the request never got an answer.

use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use serde_json::Value;
use tracing::warn;

use super::CaptureParser;
use crate::error::{Error, Result};
use crate::models::{CapturedExchange, Header, HttpRequest, HttpResponse, Method};

pub struct HarParser;

impl CaptureParser for HarParser {
    fn parse(&self, path: &Path) -> Result<Vec<CapturedExchange>> {
        let data = std::fs::read_to_string(path)?;
        parse_str(&data, &path.display().to_string())
    }
}

/// Parse HAR JSON text. Entries without a usable request URL are skipped.
pub fn parse_str(data: &str, context: &str) -> Result<Vec<CapturedExchange>> {
    let json: Value =
        serde_json::from_str(data).map_err(|e| Error::Capture(format!("{}: {}", context, e)))?;
    let entries = json
        .get("log")
        .and_then(|log| log.get("entries"))
        .and_then(|entries| entries.as_array())
        .ok_or_else(|| Error::Capture(format!("{}: missing log.entries", context)))?;

    let mut exchanges = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        match parse_entry(entry) {
            Some(exchange) => exchanges.push(exchange),
            None => warn!("{}: skipping HAR entry #{}", context, i + 1),
        }
    }
    Ok(exchanges)
}

fn parse_entry(entry: &Value) -> Option<CapturedExchange> {
    let req = entry.get("request")?;
    let method = req.get("method").and_then(|m| m.as_str()).unwrap_or("GET");
    let url = req.get("url").and_then(|u| u.as_str())?;

    let mut request = HttpRequest::from_url(Method::from(method), url).ok()?;
    request.headers = parse_headers(req.get("headers"));
    if let Some(text) = req
        .get("postData")
        .and_then(|p| p.get("text"))
        .and_then(|t| t.as_str())
    {
        request.body = text.as_bytes().to_vec();
    }

    let response = entry.get("response").and_then(parse_response);
    Some(CapturedExchange::new(request, response))
}

fn parse_response(res: &Value) -> Option<HttpResponse> {
    let status = res.get("status").and_then(|s| s.as_u64())?;
    if status == 0 || status > u16::MAX as u64 {
        return None;
    }
    let mut response = HttpResponse::new(status as u16);
    if let Some(reason) = res.get("statusText").and_then(|s| s.as_str()) {
        if !reason.is_empty() {
            response.reason = reason.to_string();
        }
    }
    response.headers = parse_headers(res.get("headers"));

    if let Some(content) = res.get("content") {
        let text = content.get("text").and_then(|t| t.as_str()).unwrap_or("");
        let base64 = content
            .get("encoding")
            .and_then(|e| e.as_str())
            .map_or(false, |e| e.eq_ignore_ascii_case("base64"));
        response.body = if base64 {
            general_purpose::STANDARD.decode(text.trim()).unwrap_or_else(|e| {
                warn!("Invalid base64 response content: {}", e);
                Vec::new()
            })
        } else {
            text.as_bytes().to_vec()
        };
    }
    Some(response)
}

fn parse_headers(headers: Option<&Value>) -> Vec<Header> {
    let mut parsed = Vec::new();
    if let Some(array) = headers.and_then(|h| h.as_array()) {
        for header in array {
            let name = header.get("name").and_then(|n| n.as_str()).unwrap_or("");
            if name.is_empty() || name.starts_with(':') {
                continue;
            }
            let value = header.get("value").and_then(|v| v.as_str()).unwrap_or("");
            parsed.push(Header::new(name, value));
        }
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    const HAR: &str = r#"{"log": {"version": "1.2", "entries": [
        {
            "request": {
                "method": "GET",
                "url": "https://shop.test/account/orders?page=2",
                "headers": [
                    {"name": ":authority", "value": "shop.test"},
                    {"name": "Cookie", "value": "session=abc"}
                ]
            },
            "response": {
                "status": 200,
                "statusText": "OK",
                "headers": [{"name": "Content-Type", "value": "text/html"}],
                "content": {"size": 5, "mimeType": "text/html", "text": "aGVsbG8=", "encoding": "base64"}
            }
        },
        {
            "request": {"method": "POST", "url": "https://shop.test/cart", "headers": [],
                        "postData": {"mimeType": "application/json", "text": "{\"sku\":1}"}},
            "response": {"status": 0, "statusText": "", "headers": [], "content": {}}
        },
        {"request": {"method": "GET", "url": "not a url"}}
    ]}}"#;

    #[test]
    fn parses_entries_and_skips_pseudo_headers() {
        let exchanges = parse_str(HAR, "test.har").unwrap();
        assert_eq!(exchanges.len(), 2);

        let first = &exchanges[0];
        assert_eq!(first.request.target, "/account/orders?page=2");
        assert_eq!(first.request.headers, vec![Header::new("Cookie", "session=abc")]);
        let response = first.response.as_ref().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello".to_vec());
    }

    #[test]
    fn zero_status_means_no_response() {
        let exchanges = parse_str(HAR, "test.har").unwrap();
        let second = &exchanges[1];
        assert_eq!(second.request.method, Method::POST);
        assert_eq!(second.request.body, b"{\"sku\":1}".to_vec());
        assert!(second.response.is_none());
    }

    #[test]
    fn missing_entries_is_an_error() {
        assert!(parse_str(r#"{"log": {}}"#, "empty.har").is_err());
    }
}
