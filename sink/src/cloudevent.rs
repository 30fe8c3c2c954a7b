//! Parses a CloudEvent off an inbound HTTP request, in either structured or
//! binary content mode.

use http::HeaderMap;
use kubearchive_types::CloudEvent;

const STRUCTURED_CONTENT_TYPE: &str = "application/cloudevents+json";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("missing required CloudEvents header {0}")]
    MissingHeader(&'static str),
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

pub fn parse(headers: &HeaderMap, body: &[u8]) -> Result<CloudEvent, ParseError> {
    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.starts_with(STRUCTURED_CONTENT_TYPE) {
        parse_structured(body)
    } else {
        parse_binary(headers, body)
    }
}

fn parse_structured(body: &[u8]) -> Result<CloudEvent, ParseError> {
    Ok(serde_json::from_slice(body)?)
}

fn parse_binary(headers: &HeaderMap, body: &[u8]) -> Result<CloudEvent, ParseError> {
    let required = |name: &'static str| -> Result<String, ParseError> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(ParseError::MissingHeader(name))
    };
    let optional = |name: &'static str| -> Option<String> {
        headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
    };

    let id = required("ce-id")?;
    let source = required("ce-source")?;
    let specversion = required("ce-specversion")?;
    let event_type = required("ce-type")?;
    let apiversion = optional("ce-apiversion");
    let kind = optional("ce-kind");
    let name = optional("ce-name");
    let namespace = optional("ce-namespace");

    let data = if body.is_empty() {
        None
    } else {
        Some(serde_json::from_slice(body)?)
    };

    Ok(CloudEvent {
        id,
        source,
        specversion,
        event_type,
        apiversion,
        kind,
        name,
        namespace,
        data,
    })
}

/// Envelope-level validity check independent of whether the `data` payload
/// turns out to be a usable Kubernetes object.
pub fn is_valid_envelope(event: &CloudEvent) -> bool {
    !event.id.is_empty()
        && !event.source.is_empty()
        && !event.event_type.is_empty()
        && event.specversion.starts_with("1.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn structured_mode_parses_full_envelope() {
        let body = serde_json::json!({
            "id": "1",
            "source": "test",
            "specversion": "1.0",
            "type": "dev.kubearchive.resource.modify",
            "apiversion": "v1",
            "kind": "Pod",
            "name": "a",
            "namespace": "default",
            "data": {"metadata": {"uid": "1"}},
        })
        .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/cloudevents+json"),
        );

        let event = parse(&headers, body.as_bytes()).unwrap();
        assert_eq!(event.id, "1");
        assert!(event.data.is_some());
        assert!(is_valid_envelope(&event));
    }

    #[test]
    fn binary_mode_requires_ce_headers() {
        let headers = HeaderMap::new();
        let err = parse(&headers, b"{}").unwrap_err();
        assert!(matches!(err, ParseError::MissingHeader("ce-id")));
    }

    #[test]
    fn binary_mode_reads_extensions_and_body() {
        let mut headers = HeaderMap::new();
        headers.insert("ce-id", HeaderValue::from_static("1"));
        headers.insert("ce-source", HeaderValue::from_static("test"));
        headers.insert("ce-specversion", HeaderValue::from_static("1.0"));
        headers.insert("ce-type", HeaderValue::from_static("dev.kubearchive.resource.delete"));
        headers.insert("ce-kind", HeaderValue::from_static("Pod"));
        headers.insert("ce-apiversion", HeaderValue::from_static("v1"));

        let event = parse(&headers, br#"{"metadata": {"uid": "1"}}"#).unwrap();
        assert_eq!(event.kind.as_deref(), Some("Pod"));
        assert!(event.is_delete());
    }
}
