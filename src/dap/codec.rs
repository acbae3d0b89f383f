//! Text framing: `Content-Length: <N>\r\n\r\n<payload>`.
//!
//! A missing or malformed `Content-Length`, or EOF inside the payload, is
//! a protocol error and fatal to the connection. All other headers are
//! ignored.

use std::io::{BufRead, Write};

use serde::Serialize;
use serde_json::Value;

use crate::debugger::error::Error;

pub fn read_message<R: BufRead>(reader: &mut R) -> Result<Value, Error> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let read_n = reader.read_line(&mut line)?;
        if read_n == 0 {
            return Err(Error::ConnectionClosed);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Length:") {
            let parsed = value
                .trim()
                .parse()
                .map_err(|_| Error::Transport(format!("bad Content-Length: {value:?}")))?;
            content_length = Some(parsed);
        }
    }

    let len =
        content_length.ok_or_else(|| Error::Transport("missing Content-Length header".into()))?;
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .map_err(|_| Error::Transport(format!("short read: expected {len} payload bytes")))?;
    let msg: Value = serde_json::from_slice(&buf)?;
    Ok(msg)
}

pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), Error> {
    let payload = serde_json::to_vec(message)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())
        .and_then(|_| writer.write_all(&payload))
        .and_then(|_| writer.flush())
        .map_err(|e| Error::Transport(format!("write: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{BufReader, Cursor};

    #[test]
    fn test_round_trip() {
        let mut buf = Vec::new();
        write_message(&mut buf, &json!({"seq": 1, "type": "request"})).unwrap();
        let mut reader = BufReader::new(Cursor::new(buf));
        let msg = read_message(&mut reader).unwrap();
        assert_eq!(msg["seq"], 1);
    }

    #[test]
    fn test_other_headers_ignored() {
        let payload = br#"{"ok":true}"#;
        let framed = format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            payload.len(),
            std::str::from_utf8(payload).unwrap()
        );
        let mut reader = BufReader::new(Cursor::new(framed.into_bytes()));
        let msg = read_message(&mut reader).unwrap();
        assert_eq!(msg["ok"], true);
    }

    #[test]
    fn test_missing_content_length() {
        let mut reader = BufReader::new(Cursor::new(b"X-Nope: 1\r\n\r\n{}".to_vec()));
        let err = read_message(&mut reader).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_non_integer_content_length() {
        let mut reader = BufReader::new(Cursor::new(b"Content-Length: soon\r\n\r\n{}".to_vec()));
        let err = read_message(&mut reader).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_premature_eof_in_payload() {
        let mut reader = BufReader::new(Cursor::new(b"Content-Length: 99\r\n\r\n{}".to_vec()));
        let err = read_message(&mut reader).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_eof_before_header_is_closed() {
        let mut reader = BufReader::new(Cursor::new(Vec::new()));
        let err = read_message(&mut reader).unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }
}
