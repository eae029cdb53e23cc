use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::trace;

use crate::error::{CollectorError, TransportError};

/// Shared blocking HTTP transport. One instance serves every source; it only
/// classifies outcomes, retrying and pacing happen in the client pipeline.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, CollectorError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!(
                "chemdata-collector/{}",
                env!("CARGO_PKG_VERSION")
            ))
            .map_err(|err| CollectorError::HttpClient(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| CollectorError::HttpClient(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn get_json(&self, url: &str) -> Result<Value, TransportError> {
        trace!(%url, "GET");
        let response = send(self.client.get(url).header(ACCEPT, "application/json"))?;
        response
            .json::<Value>()
            .map_err(|err| TransportError::Permanent(format!("invalid JSON body: {err}")))
    }

    pub fn get_text(&self, url: &str) -> Result<String, TransportError> {
        trace!(%url, "GET");
        let response = send(self.client.get(url))?;
        response.text().map_err(|err| classify_error(&err))
    }

    pub fn post_json(&self, url: &str, body: &Value) -> Result<Value, TransportError> {
        trace!(%url, "POST");
        let response = send(
            self.client
                .post(url)
                .header(ACCEPT, "application/json")
                .json(body),
        )?;
        response
            .json::<Value>()
            .map_err(|err| TransportError::Permanent(format!("invalid JSON body: {err}")))
    }
}

fn send(request: RequestBuilder) -> Result<Response, TransportError> {
    let response = request.send().map_err(|err| classify_error(&err))?;
    let status = response.status().as_u16();
    if response.status().is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .ok()
        .map(|body| body.chars().take(200).collect::<String>())
        .unwrap_or_default();
    Err(classify_status(status, &message))
}

/// 404 means "no record", 429 and 5xx are worth retrying, any other
/// non-success status is final.
pub fn classify_status(status: u16, message: &str) -> TransportError {
    let detail = if message.trim().is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", message.trim())
    };
    match status {
        404 => TransportError::NotFound,
        status if is_retryable_status(status) => TransportError::Transient(detail),
        _ => TransportError::Permanent(detail),
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

fn classify_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        TransportError::Transient(err.to_string())
    } else {
        TransportError::Permanent(err.to_string())
    }
}

pub fn encode_url_component(value: &str) -> String {
    let mut out = String::new();
    for byte in value.as_bytes() {
        let ch = *byte as char;
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '~') {
            out.push(ch);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

pub fn build_query_url(base: &str, params: &[(&str, &str)]) -> String {
    if params.is_empty() {
        return base.to_string();
    }
    let query = params
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                encode_url_component(key),
                encode_url_component(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("{base}?{query}")
}

/// Reads a JSON number or a numeric string, as several APIs report
/// measurements as strings.
pub fn json_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|value| value.is_finite())
}

pub fn json_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(404, ""), TransportError::NotFound);
        assert_matches!(classify_status(429, ""), TransportError::Transient(_));
        assert_matches!(classify_status(503, "busy"), TransportError::Transient(msg) if msg == "HTTP 503: busy");
        assert_matches!(classify_status(400, ""), TransportError::Permanent(msg) if msg == "HTTP 400");
        assert_matches!(classify_status(403, ""), TransportError::Permanent(_));
    }

    #[test]
    fn query_urls_are_encoded() {
        let url = build_query_url(
            "https://example.org/search",
            &[("term", "acetylsalicylic acid"), ("smiles", "C=C(O)#N")],
        );
        assert_eq!(
            url,
            "https://example.org/search?term=acetylsalicylic%20acid&smiles=C%3DC%28O%29%23N"
        );
        assert_eq!(build_query_url("https://example.org", &[]), "https://example.org");
    }

    #[test]
    fn numbers_from_strings() {
        assert_eq!(json_number(&json!("180.16")), Some(180.16));
        assert_eq!(json_number(&json!(1.2)), Some(1.2));
        assert_eq!(json_number(&json!("n/a")), None);
        assert_eq!(json_number(&Value::Null), None);
    }
}
