use crate::handler::Body;
use crate::headers::BusHeaders;
use std::error::Error;

/// Represents a way of decoding the payload of an incoming message (received
/// as a sequence of bytes) into an arbitrary result type, with access to the
/// bus headers of the message.
///
/// A decoding failure marks the message as poison; what happens to a poison
/// message is the delivery pipeline's decision, not the decoder's.
pub trait Decoder {
    /// The type of decoded result.
    type Result;

    /// The type of error produced when decoding is not possible.
    type Error: Error;

    /// Decodes the given bytes into the desired [`Result`](Decoder::Result),
    /// or returns an appropriate [`Error`](Decoder::Error).
    fn decode(&self, bytes: &[u8], headers: &BusHeaders) -> Result<Self::Result, Self::Error>;
}

/// Implements [`Decoder`] for any function or closure of the right shape.
impl<F, R, E> Decoder for F
where
    F: Fn(&[u8], &BusHeaders) -> Result<R, E>,
    E: Error,
{
    type Result = R;
    type Error = E;

    fn decode(&self, bytes: &[u8], headers: &BusHeaders) -> Result<Self::Result, Self::Error> {
        self(bytes, headers)
    }
}

/// The standard bus decoder: bodies flagged as raw bytes (the `isBuffer`
/// header) pass through untouched, everything else must parse as JSON.
#[derive(Default)]
pub struct BodyDecoder;

impl Decoder for BodyDecoder {
    type Result = Body;
    type Error = serde_json::Error;

    fn decode(&self, bytes: &[u8], headers: &BusHeaders) -> Result<Self::Result, Self::Error> {
        if headers.is_buffer() {
            return Ok(Body::Bytes(bytes.to_vec()));
        }

        serde_json::from_slice(bytes).map(Body::Json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn json_bodies_are_parsed() {
        // Given
        let headers = BusHeaders::stamp("a.b", None, None, false);

        // When
        let body = BodyDecoder.decode(br#"{"n": 1}"#, &headers).unwrap();

        // Then
        assert_eq!(body, Body::Json(json!({"n": 1})));
    }

    #[test]
    fn buffer_bodies_pass_through() {
        // Given: bytes that are not valid JSON
        let headers = BusHeaders::stamp("a.b", None, None, true);

        // When
        let body = BodyDecoder.decode(&[0xde, 0xad], &headers).unwrap();

        // Then
        assert_eq!(body, Body::Bytes(vec![0xde, 0xad]));
    }

    #[test]
    fn gibberish_is_a_decoding_error() {
        // Given
        let headers = BusHeaders::stamp("a.b", None, None, false);

        // Then
        assert!(BodyDecoder.decode(b"not json", &headers).is_err());
    }

    #[test]
    fn closures_are_decoders() {
        // Given
        let decoder = |bytes: &[u8], _headers: &BusHeaders| {
            String::from_utf8(bytes.to_vec())
        };
        let headers = BusHeaders::stamp("a.b", None, None, false);

        // Then
        assert_eq!(decoder.decode(b"hello", &headers).unwrap(), "hello");
    }
}
