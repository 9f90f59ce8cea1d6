//! CoAP over UDP (RFC 7252). The fuzz payload goes after the payload marker,
//! header fields are taken from the request parameters.
use crate::protocol::{FrameContext, ProtocolHandler, ResponseClass, OPERATION_PARAM};

const VERSION: u8 = 1;
const OPTION_OBSERVE: u16 = 6;
const OPTION_URI_PATH: u16 = 11;
const PAYLOAD_MARKER: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageType {
    Confirmable = 0,
    NonConfirmable = 1,
    Acknowledgement = 2,
    Reset = 3,
}

impl MessageType {
    fn from_param(value: Option<&str>) -> Self {
        match value {
            Some("non") => MessageType::NonConfirmable,
            Some("ack") => MessageType::Acknowledgement,
            Some("rst") => MessageType::Reset,
            _ => MessageType::Confirmable,
        }
    }
}

/// Parses "c.dd" into the packed code byte, GET (0.01) otherwise.
fn parse_code(value: Option<&str>) -> u8 {
    value
        .and_then(|v| v.split_once('.'))
        .and_then(|(class, detail)| Some((class.parse::<u8>().ok()?, detail.parse::<u8>().ok()?)))
        .filter(|(class, detail)| *class < 8 && *detail < 32)
        .map(|(class, detail)| (class << 5) | detail)
        .unwrap_or(0x01)
}

fn option_nibble(value: usize) -> (u8, Vec<u8>) {
    match value {
        0..=12 => (value as u8, Vec::new()),
        13..=268 => (13, vec![(value - 13) as u8]),
        _ => (
            14,
            u16::try_from(value - 269)
                .unwrap_or(u16::MAX)
                .to_be_bytes()
                .to_vec(),
        ),
    }
}

fn push_option(out: &mut Vec<u8>, last: &mut u16, number: u16, value: &[u8]) {
    let (delta, delta_ext) = option_nibble((number - *last) as usize);
    let (length, length_ext) = option_nibble(value.len());
    *last = number;
    out.push((delta << 4) | length);
    out.extend(delta_ext);
    out.extend(length_ext);
    out.extend_from_slice(value);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoapHandler;

impl ProtocolHandler for CoapHandler {
    fn name(&self) -> &'static str {
        "coap"
    }

    fn encode(&self, ctx: &FrameContext<'_>) -> Vec<u8> {
        if ctx.raw() {
            return ctx.payload.to_vec();
        }
        let message_type = MessageType::from_param(ctx.param("type"));
        let message_id = ctx.sequence.unwrap_or(ctx.request_id as u32) as u16;
        let token = (ctx.request_id as u32).to_be_bytes();

        let mut out = Vec::with_capacity(ctx.payload.len() + 32);
        out.push((VERSION << 6) | ((message_type as u8) << 4) | token.len() as u8);
        out.push(parse_code(ctx.param("code")));
        out.extend_from_slice(&message_id.to_be_bytes());
        out.extend_from_slice(&token);

        let mut last = 0;
        if ctx.param(OPERATION_PARAM) == Some("observe") {
            push_option(&mut out, &mut last, OPTION_OBSERVE, &[]);
        }
        let path = ctx
            .param("path")
            .map(str::to_string)
            .or_else(|| ctx.endpoint.path.clone())
            .unwrap_or_default();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            push_option(&mut out, &mut last, OPTION_URI_PATH, segment.as_bytes());
        }
        if !ctx.payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(ctx.payload);
        }
        out
    }

    fn classify(&self, _ctx: &FrameContext<'_>, response: &[u8]) -> ResponseClass {
        if response.len() < 4 {
            return ResponseClass::Rejected("short coap response".to_string());
        }
        if response[0] >> 6 != VERSION {
            return ResponseClass::Rejected(format!("coap version {}", response[0] >> 6));
        }
        if (response[0] >> 4) & 0b11 == MessageType::Reset as u8 {
            return ResponseClass::Rejected("coap reset".to_string());
        }
        let class = response[1] >> 5;
        let detail = response[1] & 0x1F;
        match (class, detail) {
            (0, _) | (2, _) => ResponseClass::Accepted,
            (5, 0) => ResponseClass::Fatal("coap 5.00 internal server error".to_string()),
            _ => ResponseClass::Rejected(format!("coap {class}.{detail:02}")),
        }
    }
}
