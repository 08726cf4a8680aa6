//! Minimal CoAP message serialisation (RFC 7252 wire format, the subset
//! this protocol actually uses: no block-wise transfer, no proxying
//! options).

use crate::error::WireError;

/// CoAP message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoapType {
    Con = 0,
    Non = 1,
    Ack = 2,
    Rst = 3,
}

impl CoapType {
    fn from_bits(bits: u8) -> Result<Self, WireError> {
        match bits {
            0 => Ok(CoapType::Con),
            1 => Ok(CoapType::Non),
            2 => Ok(CoapType::Ack),
            3 => Ok(CoapType::Rst),
            _ => Err(WireError::MalformedMessage("invalid CoAP type bits".into())),
        }
    }
}

/// CoAP option numbers used by this protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum OptionNumber {
    UriPath = 11,
    UriQuery = 15,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

impl CoapOption {
    pub fn uri_path(path: impl Into<Vec<u8>>) -> Self {
        Self { number: OptionNumber::UriPath as u16, value: path.into() }
    }

    pub fn uri_query(value: impl Into<Vec<u8>>) -> Self {
        Self { number: OptionNumber::UriQuery as u16, value: value.into() }
    }
}

/// A parsed or to-be-serialised CoAP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    pub mtype: CoapType,
    pub code: u8,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl CoapMessage {
    pub fn new(mtype: CoapType, code: u8, message_id: u16) -> Self {
        Self { mtype, code, message_id, token: Vec::new(), options: Vec::new(), payload: Vec::new() }
    }

    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.token = token;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_option(mut self, option: CoapOption) -> Self {
        self.options.push(option);
        self
    }

    /// First URI_PATH option, if any, as a UTF-8 string.
    pub fn uri_path(&self) -> Option<String> {
        self.options
            .iter()
            .find(|o| o.number == OptionNumber::UriPath as u16)
            .map(|o| String::from_utf8_lossy(&o.value).into_owned())
    }

    /// All URI_QUERY option values, in wire order.
    pub fn uri_queries(&self) -> Vec<&[u8]> {
        self.options
            .iter()
            .filter(|o| o.number == OptionNumber::UriQuery as u16)
            .map(|o| o.value.as_slice())
            .collect()
    }

    /// Serialise to the CoAP wire format.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if self.token.len() > 8 {
            return Err(WireError::MalformedMessage("token longer than 8 bytes".into()));
        }

        let mut out = Vec::new();
        let ver_type_tkl = (1 << 6) | ((self.mtype as u8) << 4) | (self.token.len() as u8);
        out.push(ver_type_tkl);
        out.push(self.code);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.token);

        let mut sorted_options = self.options.clone();
        sorted_options.sort_by_key(|o| o.number);

        let mut prev_number = 0u16;
        for option in &sorted_options {
            let delta = option.number - prev_number;
            prev_number = option.number;
            encode_option(&mut out, delta, &option.value)?;
        }

        if !self.payload.is_empty() {
            out.push(0xFF);
            out.extend_from_slice(&self.payload);
        }

        Ok(out)
    }

    /// Parse from the CoAP wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < 4 {
            return Err(WireError::MalformedMessage("message shorter than 4-byte header".into()));
        }

        let ver = bytes[0] >> 6;
        if ver != 1 {
            return Err(WireError::MalformedMessage(format!("unsupported CoAP version {ver}")));
        }
        let mtype = CoapType::from_bits((bytes[0] >> 4) & 0x3)?;
        let tkl = (bytes[0] & 0x0F) as usize;
        if tkl > 8 {
            return Err(WireError::MalformedMessage("token length > 8".into()));
        }

        let code = bytes[1];
        let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);

        let mut pos = 4;
        if bytes.len() < pos + tkl {
            return Err(WireError::MalformedMessage("truncated token".into()));
        }
        let token = bytes[pos..pos + tkl].to_vec();
        pos += tkl;

        let mut options = Vec::new();
        let mut prev_number = 0u16;

        while pos < bytes.len() {
            if bytes[pos] == 0xFF {
                pos += 1;
                break;
            }

            let (number, value, consumed) = decode_option(&bytes[pos..], prev_number)?;
            prev_number = number;
            pos += consumed;
            options.push(CoapOption { number, value });
        }

        let payload = bytes[pos..].to_vec();

        Ok(CoapMessage { mtype, code, message_id, token, options, payload })
    }
}

fn encode_option(out: &mut Vec<u8>, delta: u16, value: &[u8]) -> Result<(), WireError> {
    let (delta_nibble, delta_ext) = nibble_and_ext(delta)?;
    let (len_nibble, len_ext) = nibble_and_ext(value.len() as u16)?;

    out.push((delta_nibble << 4) | len_nibble);
    out.extend_from_slice(&delta_ext);
    out.extend_from_slice(&len_ext);
    out.extend_from_slice(value);
    Ok(())
}

fn nibble_and_ext(n: u16) -> Result<(u8, Vec<u8>), WireError> {
    match n {
        0..=12 => Ok((n as u8, Vec::new())),
        13..=268 => Ok((13, vec![(n - 13) as u8])),
        269..=65804 => {
            let ext = n - 269;
            Ok((14, ext.to_be_bytes().to_vec()))
        }
        _ => Err(WireError::MalformedMessage("option delta/length too large".into())),
    }
}

fn decode_option(bytes: &[u8], prev_number: u16) -> Result<(u16, Vec<u8>, usize), WireError> {
    if bytes.is_empty() {
        return Err(WireError::MalformedMessage("truncated option header".into()));
    }

    let delta_nibble = bytes[0] >> 4;
    let len_nibble = bytes[0] & 0x0F;
    let mut pos = 1;

    let delta = read_extended(delta_nibble, bytes, &mut pos)?;
    let length = read_extended(len_nibble, bytes, &mut pos)? as usize;

    if bytes.len() < pos + length {
        return Err(WireError::MalformedMessage("truncated option value".into()));
    }

    let value = bytes[pos..pos + length].to_vec();
    pos += length;

    Ok((prev_number + delta, value, pos))
}

fn read_extended(nibble: u8, bytes: &[u8], pos: &mut usize) -> Result<u16, WireError> {
    match nibble {
        0..=12 => Ok(nibble as u16),
        13 => {
            let b = *bytes.get(*pos).ok_or_else(|| WireError::MalformedMessage("truncated extended option".into()))?;
            *pos += 1;
            Ok(13 + b as u16)
        }
        14 => {
            let hi = *bytes.get(*pos).ok_or_else(|| WireError::MalformedMessage("truncated extended option".into()))?;
            let lo = *bytes.get(*pos + 1).ok_or_else(|| WireError::MalformedMessage("truncated extended option".into()))?;
            *pos += 2;
            Ok(269 + u16::from_be_bytes([hi, lo]))
        }
        15 => Err(WireError::MalformedMessage("reserved option nibble 15 (payload marker in option position)".into())),
        _ => unreachable!("nibble is 4 bits"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_simple_message() {
        let msg = CoapMessage::new(CoapType::Con, 0x01, 42)
            .with_token(vec![1, 2, 3])
            .with_option(CoapOption::uri_path("c"))
            .with_payload(vec![9, 9, 9]);

        let encoded = msg.encode().unwrap();
        let decoded = CoapMessage::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trips_multiple_options_out_of_order() {
        let msg = CoapMessage::new(CoapType::Non, 0x02, 7)
            .with_option(CoapOption::uri_query(vec![0, 0, 0, 1]))
            .with_option(CoapOption::uri_path("Chunk"))
            .with_option(CoapOption::uri_query(vec![0, 2]));

        let encoded = msg.encode().unwrap();
        let decoded = CoapMessage::decode(&encoded).unwrap();

        assert_eq!(decoded.uri_path().as_deref(), Some("Chunk"));
        assert_eq!(decoded.uri_queries().len(), 2);
    }

    #[test]
    fn round_trips_empty_payload_and_token() {
        let msg = CoapMessage::new(CoapType::Ack, 0x44, 1);
        let encoded = msg.encode().unwrap();
        let decoded = CoapMessage::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn rejects_token_over_8_bytes() {
        let msg = CoapMessage::new(CoapType::Con, 1, 1).with_token(vec![0; 9]);
        assert!(msg.encode().is_err());
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(CoapMessage::decode(&[1, 2]).is_err());
    }

    #[test]
    fn large_option_value_uses_extended_length() {
        let big = vec![0xAB; 300];
        let msg = CoapMessage::new(CoapType::Con, 1, 1).with_option(CoapOption { number: 11, value: big.clone() });
        let encoded = msg.encode().unwrap();
        let decoded = CoapMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.options[0].value, big);
    }
}
