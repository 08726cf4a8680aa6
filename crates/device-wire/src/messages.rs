//! The symbolic message table.
//!
//! Device firmware and this server agree on a fixed mapping from message
//! name to CoAP code and URI path. Nothing upstream of this module is
//! allowed to hardcode a raw code or path string — this is the single
//! source of truth for that mapping within this codebase.

use crate::coap::{CoapMessage, CoapType};

/// Every message name this protocol exchanges, in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageName {
    Hello,
    Describe,
    UpdateBegin,
    UpdateReady,
    UpdateAbort,
    Chunk,
    ChunkReceived,
    ChunkMissed,
    ChunkMissedAck,
    UpdateDone,
    FunctionCall,
    FunctionReturn,
    VariableRequest,
    VariableValue,
    SignalStart,
    SignalStartReturn,
    Event,
    Subscribe,
    KeyChange,
    PrivateEvent,
    PublicEvent,
    GetTime,
    Ping,
    SocketPing,
}

impl MessageName {
    /// CoAP code this message is sent with.
    ///
    /// Codes follow the `(class << 5) | detail` convention: `0.xx` for
    /// requests, `2.xx` for successful responses.
    pub const fn code(self) -> u8 {
        match self {
            MessageName::Hello => 0x01,
            MessageName::Describe => 0x02,
            MessageName::FunctionCall => 0x02,
            MessageName::VariableRequest => 0x01,
            MessageName::Event => 0x02,
            MessageName::PrivateEvent => 0x02,
            MessageName::PublicEvent => 0x02,
            MessageName::Subscribe => 0x01,
            MessageName::UpdateBegin => 0x02,
            MessageName::UpdateReady => 0x44,
            MessageName::Chunk => 0x02,
            MessageName::ChunkReceived => 0x44,
            MessageName::ChunkMissed => 0x01,
            MessageName::ChunkMissedAck => 0x44,
            MessageName::UpdateAbort => 0xA3,
            MessageName::UpdateDone => 0x44,
            MessageName::SignalStart => 0x02,
            MessageName::FunctionReturn => 0x44,
            MessageName::VariableValue => 0x44,
            MessageName::SignalStartReturn => 0x44,
            MessageName::KeyChange => 0x02,
            MessageName::GetTime => 0x01,
            MessageName::Ping => 0x00,
            MessageName::SocketPing => 0x00,
        }
    }

    /// CoAP message type this message is ordinarily sent with.
    pub const fn coap_type(self) -> CoapType {
        match self {
            MessageName::Ping | MessageName::SocketPing => CoapType::Con,
            MessageName::ChunkMissed => CoapType::Non,
            MessageName::UpdateReady
            | MessageName::ChunkReceived
            | MessageName::ChunkMissedAck
            | MessageName::UpdateDone
            | MessageName::FunctionReturn
            | MessageName::VariableValue
            | MessageName::SignalStartReturn => CoapType::Ack,
            _ => CoapType::Con,
        }
    }

    /// URI path option value for request-shaped messages. Response-shaped
    /// messages (acks, returns) carry no URI path of their own — they are
    /// correlated to their request by CoAP message id / token instead.
    pub const fn uri_path(self) -> Option<&'static str> {
        match self {
            MessageName::Hello => Some("h"),
            MessageName::Describe => Some("d"),
            MessageName::FunctionCall => Some("f"),
            MessageName::VariableRequest => Some("v"),
            MessageName::Event | MessageName::PrivateEvent | MessageName::PublicEvent => Some("e"),
            MessageName::Subscribe => Some("e"),
            MessageName::UpdateBegin => Some("u"),
            MessageName::Chunk => Some("c"),
            MessageName::ChunkMissed => Some("c"),
            MessageName::SignalStart => Some("s"),
            MessageName::KeyChange => Some("k"),
            MessageName::GetTime => Some("t"),
            _ => None,
        }
    }

    /// Resolve a decoded [`CoapMessage`] back to a symbolic name, using its
    /// type/code and (where relevant) URI path.
    pub fn recognize(msg: &CoapMessage) -> Option<MessageName> {
        let path = msg.uri_path();
        match (msg.code, path.as_deref()) {
            (0x01, Some("h")) => Some(MessageName::Hello),
            (0x02, Some("d")) => Some(MessageName::Describe),
            (0x02, Some("f")) => Some(MessageName::FunctionCall),
            (0x01, Some("v")) => Some(MessageName::VariableRequest),
            (0x02, Some("e")) => Some(MessageName::Event),
            (0x01, Some("e")) => Some(MessageName::Subscribe),
            (0x02, Some("u")) => Some(MessageName::UpdateBegin),
            (0x02, Some("c")) => Some(MessageName::Chunk),
            (0x01, Some("c")) => Some(MessageName::ChunkMissed),
            (0x02, Some("s")) => Some(MessageName::SignalStart),
            (0x02, Some("k")) => Some(MessageName::KeyChange),
            (0x01, Some("t")) => Some(MessageName::GetTime),
            (0x44, None) if msg.mtype == CoapType::Ack => Some(MessageName::UpdateReady),
            (0x00, None) => Some(MessageName::Ping),
            (0xA3, None) => Some(MessageName::UpdateAbort),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_messages_carry_a_uri_path() {
        for name in [MessageName::Hello, MessageName::Chunk, MessageName::FunctionCall] {
            assert!(name.uri_path().is_some());
        }
    }

    #[test]
    fn response_messages_carry_no_uri_path() {
        for name in [MessageName::ChunkReceived, MessageName::VariableValue] {
            assert!(name.uri_path().is_none());
        }
    }

    #[test]
    fn recognize_round_trips_request_shaped_messages() {
        for name in [MessageName::Hello, MessageName::Describe, MessageName::Chunk, MessageName::ChunkMissed] {
            let msg = CoapMessage::new(name.coap_type(), name.code(), 1)
                .with_option(crate::coap::CoapOption::uri_path(name.uri_path().unwrap()));
            assert_eq!(MessageName::recognize(&msg), Some(name));
        }
    }
}
