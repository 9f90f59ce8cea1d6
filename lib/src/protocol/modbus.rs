//! Modbus/TCP. The payload is the PDU (function code + data), the handler adds the MBAP header.
//! The transaction identifier is the session's sequence number so responses can be matched.
use crate::protocol::{FrameContext, ProtocolHandler, ResponseClass};

const MBAP_HEADER_SIZE: usize = 7;
const EXCEPTION_FLAG: u8 = 0x80;
/// Exception code 0x04, the server hit an unrecoverable error while handling the request
const SERVER_DEVICE_FAILURE: u8 = 0x04;
/// Read Holding Registers, address 0, quantity 1
const DEFAULT_PDU: [u8; 5] = [0x03, 0x00, 0x00, 0x00, 0x01];

fn transaction_id(ctx: &FrameContext<'_>) -> u16 {
    ctx.sequence.unwrap_or(ctx.request_id as u32) as u16
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ModbusHandler;

impl ProtocolHandler for ModbusHandler {
    fn name(&self) -> &'static str {
        "modbus"
    }

    fn encode(&self, ctx: &FrameContext<'_>) -> Vec<u8> {
        if ctx.raw() {
            return ctx.payload.to_vec();
        }
        let pdu = if ctx.payload.is_empty() {
            &DEFAULT_PDU[..]
        } else {
            ctx.payload
        };
        let unit_id = ctx
            .param("unit_id")
            .and_then(|u| u.parse::<u8>().ok())
            .unwrap_or(1);
        let length = u16::try_from(pdu.len() + 1).unwrap_or(u16::MAX);

        let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + pdu.len());
        frame.extend_from_slice(&transaction_id(ctx).to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&length.to_be_bytes());
        frame.push(unit_id);
        frame.extend_from_slice(pdu);
        frame
    }

    fn classify(&self, ctx: &FrameContext<'_>, response: &[u8]) -> ResponseClass {
        if response.len() < MBAP_HEADER_SIZE + 1 {
            return ResponseClass::Rejected("short modbus response".to_string());
        }
        if response[2..4] != [0, 0] {
            return ResponseClass::Rejected("modbus protocol id is not 0".to_string());
        }
        let tid = u16::from_be_bytes([response[0], response[1]]);
        if !ctx.raw() && tid != transaction_id(ctx) {
            return ResponseClass::Rejected(format!(
                "transaction id mismatch: sent {}, got {tid}",
                transaction_id(ctx)
            ));
        }
        let function_code = response[MBAP_HEADER_SIZE];
        if function_code & EXCEPTION_FLAG == 0 {
            return ResponseClass::Accepted;
        }
        match response.get(MBAP_HEADER_SIZE + 1) {
            Some(&SERVER_DEVICE_FAILURE) => {
                ResponseClass::Fatal("modbus exception 0x04 server device failure".to_string())
            }
            Some(code) => ResponseClass::Rejected(format!("modbus exception {code:#04x}")),
            None => ResponseClass::Rejected("truncated modbus exception".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Params;
    use crate::target::Endpoint;

    fn ctx<'a>(payload: &'a [u8], params: &'a Params, endpoint: &'a Endpoint) -> FrameContext<'a> {
        FrameContext {
            request_id: 99,
            payload,
            params,
            endpoint,
            sequence: Some(7),
        }
    }

    #[test]
    fn wraps_pdu_in_mbap_header() {
        let params = Params::new();
        let endpoint = Endpoint::new("127.0.0.1", 502);
        let frame = ModbusHandler.encode(&ctx(&[0x06, 0x00, 0x01, 0x00, 0x03], &params, &endpoint));
        assert_eq!(
            frame,
            vec![0, 7, 0, 0, 0, 6, 1, 0x06, 0x00, 0x01, 0x00, 0x03]
        );
    }

    #[test]
    fn empty_payload_gets_default_read() {
        let params = Params::new();
        let endpoint = Endpoint::new("127.0.0.1", 502);
        let frame = ModbusHandler.encode(&ctx(&[], &params, &endpoint));
        assert_eq!(&frame[7..], &DEFAULT_PDU);
    }

    #[test]
    fn classifies_exceptions() {
        let params = Params::new();
        let endpoint = Endpoint::new("127.0.0.1", 502);
        let c = ctx(&[], &params, &endpoint);
        assert_eq!(
            ModbusHandler.classify(&c, &[0, 7, 0, 0, 0, 5, 1, 0x03, 2, 0, 1]),
            ResponseClass::Accepted
        );
        assert!(matches!(
            ModbusHandler.classify(&c, &[0, 7, 0, 0, 0, 3, 1, 0x83, 0x02]),
            ResponseClass::Rejected(_)
        ));
        assert!(matches!(
            ModbusHandler.classify(&c, &[0, 7, 0, 0, 0, 3, 1, 0x83, 0x04]),
            ResponseClass::Fatal(_)
        ));
        assert!(matches!(
            ModbusHandler.classify(&c, &[0, 8, 0, 0, 0, 3, 1, 0x03, 0]),
            ResponseClass::Rejected(_)
        ));
    }
}
