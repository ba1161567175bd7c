//! Decoder for the raw snapshot frame: `$<len>\r\n<len bytes>` with **no** trailing CRLF.
//! This is the one place on the wire that deviates from the ordinary bulk-string framing
//! in [`super::resp`], so it gets its own small decoder rather than overloading
//! [`super::resp::decode`].

use super::resp::{find_first_crlf, ParseError, Result};

pub struct RawFrame {
    pub payload: Vec<u8>,
    pub len: usize,
}

pub fn decode_raw_frame(message: &[u8]) -> Result<RawFrame> {
    match find_first_crlf(message) {
        Some(header_end) => {
            let size = std::str::from_utf8(&message[1..header_end])
                .map_err(|e| ParseError::Invalid(e.to_string()))?
                .parse::<usize>()
                .map_err(|e| ParseError::Invalid(e.to_string()))?;
            let payload_start = header_end + 2;
            if payload_start + size > message.len() {
                return Err(ParseError::Incomplete);
            }
            Ok(RawFrame {
                payload: message[payload_start..payload_start + size].to_vec(),
                len: payload_start + size,
            })
        }
        None => Err(ParseError::Incomplete),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_without_trailing_crlf() {
        let message = b"$5\r\nhello";
        let frame = decode_raw_frame(message).unwrap();
        assert_eq!(frame.payload, b"hello");
        assert_eq!(frame.len, message.len());
    }

    #[test]
    fn incomplete_payload_is_reported() {
        let message = b"$5\r\nhel";
        assert!(matches!(decode_raw_frame(message), Err(ParseError::Incomplete)));
    }
}
