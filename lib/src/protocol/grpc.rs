//! gRPC-Web over HTTP/1.1: one length-prefixed message per request, status from `grpc-status`.
use crate::protocol::http::{build_request, classify_status, status_code};
use crate::protocol::{FrameContext, ProtocolHandler, ResponseClass};

/// grpc-status codes that mean the server failed while handling the message
const UNKNOWN: u32 = 2;
const INTERNAL: u32 = 13;

pub(crate) fn frame_message(message: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(message.len() + 5);
    frame.push(0);
    frame.extend_from_slice(&u32::try_from(message.len()).unwrap_or(u32::MAX).to_be_bytes());
    frame.extend_from_slice(message);
    frame
}

fn grpc_status(response: &[u8]) -> Option<u32> {
    let text = String::from_utf8_lossy(response).to_ascii_lowercase();
    let start = text.find("grpc-status:")? + "grpc-status:".len();
    let digits: String = text[start..]
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcHandler;

impl ProtocolHandler for GrpcHandler {
    fn name(&self) -> &'static str {
        "grpc"
    }

    fn encode(&self, ctx: &FrameContext<'_>) -> Vec<u8> {
        if ctx.raw() {
            return ctx.payload.to_vec();
        }
        let path = format!(
            "/{}/{}",
            ctx.param("service").unwrap_or("grpc.health.v1.Health"),
            ctx.param("method").unwrap_or("Check")
        );
        build_request(
            ctx,
            "POST",
            &path,
            &[
                ("Content-Type", "application/grpc-web+proto"),
                ("X-Grpc-Web", "1"),
                ("TE", "trailers"),
            ],
            &frame_message(ctx.payload),
        )
    }

    fn classify(&self, _ctx: &FrameContext<'_>, response: &[u8]) -> ResponseClass {
        let Some(status) = status_code(response) else {
            return ResponseClass::Rejected("malformed grpc-web response".to_string());
        };
        if status != 200 {
            return classify_status(status);
        }
        match grpc_status(response) {
            None | Some(0) => ResponseClass::Accepted,
            Some(code @ (UNKNOWN | INTERNAL)) => ResponseClass::Fatal(format!("grpc-status {code}")),
            Some(code) => ResponseClass::Rejected(format!("grpc-status {code}")),
        }
    }

    fn seeds(&self) -> Vec<Vec<u8>> {
        // HealthCheckRequest { service: "" } and { service: "fuzz" }
        vec![vec![], vec![0x0A, 0x04, b'f', b'u', b'z', b'z']]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Params;
    use crate::target::Endpoint;

    #[test]
    fn prefixes_message_length() {
        assert_eq!(frame_message(&[9, 9, 9]), vec![0, 0, 0, 0, 3, 9, 9, 9]);
    }

    #[test]
    fn request_targets_service_method() {
        let params = Params::new();
        let endpoint = Endpoint::new("127.0.0.1", 50051);
        let ctx = FrameContext {
            request_id: 1,
            payload: &[1],
            params: &params,
            endpoint: &endpoint,
            sequence: None,
        };
        let request = GrpcHandler.encode(&ctx);
        let text = String::from_utf8_lossy(&request);
        assert!(text.starts_with("POST /grpc.health.v1.Health/Check HTTP/1.1\r\n"));
        assert!(request.ends_with(&[0, 0, 0, 0, 1, 1]));
    }

    #[test]
    fn reads_grpc_status() {
        let params = Params::new();
        let endpoint = Endpoint::new("127.0.0.1", 50051);
        let ctx = FrameContext {
            request_id: 1,
            payload: &[],
            params: &params,
            endpoint: &endpoint,
            sequence: None,
        };
        assert_eq!(
            GrpcHandler.classify(&ctx, b"HTTP/1.1 200 OK\r\ngrpc-status: 0\r\n\r\n"),
            ResponseClass::Accepted
        );
        assert!(matches!(
            GrpcHandler.classify(&ctx, b"HTTP/1.1 200 OK\r\nGrpc-Status: 13\r\n\r\n"),
            ResponseClass::Fatal(_)
        ));
        assert!(matches!(
            GrpcHandler.classify(&ctx, b"HTTP/1.1 200 OK\r\ngrpc-status: 5\r\n\r\n"),
            ResponseClass::Rejected(_)
        ));
        assert!(matches!(
            GrpcHandler.classify(&ctx, b"HTTP/1.1 500 Oops\r\n\r\n"),
            ResponseClass::Fatal(_)
        ));
    }
}
