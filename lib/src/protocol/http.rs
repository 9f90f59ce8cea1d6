//! HTTP/1.1. The payload becomes the request body, method and path come from parameters.
use crate::protocol::{FrameContext, ProtocolHandler, ResponseClass};

pub(crate) fn request_path(ctx: &FrameContext<'_>) -> String {
    ctx.param("path")
        .map(str::to_string)
        .or_else(|| ctx.endpoint.path.clone())
        .unwrap_or_else(|| "/".to_string())
}

pub(crate) fn build_request(
    ctx: &FrameContext<'_>,
    method: &str,
    path: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
) -> Vec<u8> {
    let mut head = format!(
        "{method} {path} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        ctx.endpoint.address(),
        body.len()
    );
    for (name, value) in extra_headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    let mut request = head.into_bytes();
    request.extend_from_slice(body);
    request
}

/// Status code of an `HTTP/1.x NNN ...` status line.
pub(crate) fn status_code(response: &[u8]) -> Option<u16> {
    let line_end = response
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(response.len());
    let line = std::str::from_utf8(&response[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

pub(crate) fn classify_status(status: u16) -> ResponseClass {
    match status {
        100..=399 => ResponseClass::Accepted,
        500 => ResponseClass::Fatal("http 500 internal server error".to_string()),
        _ => ResponseClass::Rejected(format!("http {status}")),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpHandler;

impl ProtocolHandler for HttpHandler {
    fn name(&self) -> &'static str {
        "http"
    }

    fn encode(&self, ctx: &FrameContext<'_>) -> Vec<u8> {
        if ctx.raw() {
            return ctx.payload.to_vec();
        }
        let method = ctx.param("method").unwrap_or("POST");
        let content_type = ctx
            .param("content_type")
            .unwrap_or("application/octet-stream");
        build_request(
            ctx,
            method,
            &request_path(ctx),
            &[("Content-Type", content_type)],
            ctx.payload,
        )
    }

    fn classify(&self, _ctx: &FrameContext<'_>, response: &[u8]) -> ResponseClass {
        match status_code(response) {
            Some(status) => classify_status(status),
            None => ResponseClass::Rejected("malformed http status line".to_string()),
        }
    }

    fn seeds(&self) -> Vec<Vec<u8>> {
        vec![
            br#"{"id":1,"name":"fuzz"}"#.to_vec(),
            b"a=1&b=2".to_vec(),
            b"<?xml version=\"1.0\"?><a>1</a>".to_vec(),
        ]
    }
}
