//! Message body decoding shared by all transports.

use serde_json::Value;

/// Decode a raw message body.
///
/// Bodies that parse as JSON are returned as structured values. Anything else
/// is delivered unchanged as a string (invalid UTF-8 is replaced lossily), so
/// a malformed payload never fails the delivery.
pub fn decode_content(body: &[u8]) -> Value {
    // ---
    match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => Value::String(String::from_utf8_lossy(body).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_text_stays_text() {
        // ---
        assert_eq!(decode_content(b"test"), Value::String("test".into()));
    }

    #[test]
    fn json_object_is_parsed() {
        // ---
        let value = decode_content(br#"{"test":"data"}"#);
        assert_eq!(value["test"], "data");
    }

    #[test]
    fn json_scalars_are_parsed() {
        // ---
        assert_eq!(decode_content(b"42"), json!(42));
        assert_eq!(decode_content(b"\"quoted\""), json!("quoted"));
    }

    #[test]
    fn truncated_json_falls_back_to_text() {
        // ---
        assert_eq!(decode_content(br#"{"a":"#), json!(r#"{"a":"#));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        // ---
        let value = decode_content(&[0x66, 0x6f, 0xff]);
        assert_eq!(value, Value::String("fo\u{fffd}".into()));
    }
}
