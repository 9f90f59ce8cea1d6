//! MQTT 3.1.1. Payloads are whole control packets, every fresh session connection
//! starts with a CONNECT built from the session parameters.
use crate::protocol::{FrameContext, Params, ProtocolHandler, ResponseClass};
use mqtt::packet::ConnectPacket;
use mqtt::Encodable;
use tracing::warn;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBREC: u8 = 5;
const PUBREL: u8 = 6;
const SUBSCRIBE: u8 = 8;
const UNSUBSCRIBE: u8 = 10;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

pub(crate) fn generate_connect_packet() -> [u8; 62] {
    [
        16, 60, 0, 4, 77, 81, 84, 84, 4, 4, 0, 0, 0, 17, 72, 101, 108, 108, 111, 32, 77, 81, 84,
        84, 32, 66, 114, 111, 107, 101, 114, 0, 5, 116, 111, 112, 105, 99, 0, 22, 1, 2, 3, 4, 5, 6,
        7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 72, 255, 50, 0, 0, 0,
    ]
}

pub(crate) fn generate_publish_packet() -> [u8; 27] {
    [
        49, 25, 0, 5, 116, 111, 112, 105, 99, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 72, 255, 50,
        0, 0, 0,
    ]
}

pub(crate) fn generate_subscribe_packet() -> [u8; 12] {
    [130, 10, 0, 100, 0, 5, 116, 111, 112, 105, 99, 0]
}

pub(crate) fn generate_unsubscribe_packet() -> [u8; 11] {
    [162, 9, 0, 10, 0, 5, 116, 111, 112, 105, 99]
}

pub(crate) fn generate_disconnect_packet() -> [u8; 2] {
    [224, 0]
}

pub(crate) fn generate_pingreq_packet() -> [u8; 2] {
    [192, 0]
}

fn packet_type(packet: &[u8]) -> Option<u8> {
    packet.first().map(|b| b >> 4)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MqttHandler;

impl ProtocolHandler for MqttHandler {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn preamble(&self, params: &Params) -> Option<Vec<u8>> {
        let client_id = params
            .get("client_id")
            .map(String::as_str)
            .unwrap_or("fuzzgrid");
        let mut connect = ConnectPacket::new(client_id);
        if let (Some(user), Some(password)) = (params.get("username"), params.get("password")) {
            connect.set_user_name(Some(user.clone()));
            connect.set_password(Some(password.clone()));
        }
        let mut packet = Vec::new();
        match connect.encode(&mut packet) {
            Ok(_) => Some(packet),
            Err(e) => {
                warn!("Could not encode CONNECT for {client_id}: {e:?}, using the stock packet");
                Some(generate_connect_packet().to_vec())
            }
        }
    }

    fn encode(&self, ctx: &FrameContext<'_>) -> Vec<u8> {
        ctx.payload.to_vec()
    }

    fn expects_response(&self, ctx: &FrameContext<'_>) -> bool {
        match packet_type(ctx.payload) {
            Some(PUBLISH) => (ctx.payload[0] >> 1) & 0b11 > 0,
            Some(CONNECT | PUBREC | PUBREL | SUBSCRIBE | UNSUBSCRIBE | PINGREQ) => true,
            _ => false,
        }
    }

    fn classify(&self, _ctx: &FrameContext<'_>, response: &[u8]) -> ResponseClass {
        match packet_type(response) {
            Some(CONNACK) => match response.get(3) {
                Some(0) => ResponseClass::Accepted,
                Some(code) => ResponseClass::Rejected(format!("connack return code {code}")),
                None => ResponseClass::Rejected("truncated connack".to_string()),
            },
            Some(DISCONNECT) => ResponseClass::Rejected("broker sent disconnect".to_string()),
            Some(_) => ResponseClass::Accepted,
            None => ResponseClass::Rejected("empty mqtt response".to_string()),
        }
    }

    fn seeds(&self) -> Vec<Vec<u8>> {
        vec![
            generate_connect_packet().to_vec(),
            generate_publish_packet().to_vec(),
            generate_subscribe_packet().to_vec(),
            generate_unsubscribe_packet().to_vec(),
            generate_pingreq_packet().to_vec(),
            generate_disconnect_packet().to_vec(),
        ]
    }
}
