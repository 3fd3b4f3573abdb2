//! Parses/emits the `VERB[:LENGTH]\n[payload]` wire framing described in the
//! specification's frame codec component. A line that does not match the
//! grammar is a fatal protocol error; the caller closes the connection.

use crate::error::{ErrorType, NetworkError, NetworkResult};
use std::io::{BufRead, Write};

/// Verbs whose header field is a literal value (hex nonce, hex MAC, or
/// empty), never a length-prefixed payload.
pub const CONTROL_VERBS: &[&str] = &["challenge", "auth", "disconnect"];

/// A single decoded frame, resolved against the verb table: control verbs
/// carry their header field through verbatim, all other verbs carry a
/// length-prefixed binary payload (possibly empty).
#[derive(Debug, Eq, PartialEq)]
pub enum Frame {
    /// `challenge`, `auth`, `disconnect`: the raw text after the colon.
    Control { verb: String, field: String },
    /// Any other verb: the decoded payload bytes.
    Payload { verb: String, bytes: Vec<u8> },
}

impl Frame {
    #[inline]
    pub fn verb(&self) -> &str {
        match self {
            Frame::Control { verb, .. } => verb,
            Frame::Payload { verb, .. } => verb,
        }
    }
}

/// Reads one line of the form `VERB:FIELD` from `reader`. Returns `Ok(None)`
/// on clean EOF (peer closed before sending anything).
fn read_line(reader: &mut impl BufRead) -> NetworkResult<Option<(String, String)>> {
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| NetworkError::Fatal(ErrorType::Io(e.kind())))?;

    if read == 0 {
        return Ok(None);
    }

    let line = line.trim_end_matches(['\n', '\r']);
    match line.split_once(':') {
        Some((verb, field)) if !verb.is_empty() => Ok(Some((verb.to_string(), field.to_string()))),
        _ => Err(NetworkError::Fatal(ErrorType::MalformedFrame(line.to_string()))),
    }
}

/// Reads and fully resolves the next frame: control verbs are returned as-is,
/// other verbs with a non-empty field are read as a length-prefixed payload.
pub fn read_frame(reader: &mut impl BufRead) -> NetworkResult<Option<Frame>> {
    let (verb, field) = match read_line(reader)? {
        Some(parts) => parts,
        None => return Ok(None),
    };

    if CONTROL_VERBS.contains(&verb.as_str()) {
        return Ok(Some(Frame::Control { verb, field }));
    }

    if field.is_empty() {
        return Ok(Some(Frame::Payload { verb, bytes: Vec::new() }));
    }

    let len: usize = field
        .parse()
        .map_err(|_| NetworkError::Fatal(ErrorType::MalformedFrame(format!("{}:{}", verb, field))))?;

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| NetworkError::Fatal(ErrorType::Io(e.kind())))?;

    Ok(Some(Frame::Payload { verb, bytes }))
}

/// Writes a control frame: `VERB:field\n`, no payload.
pub fn write_control(writer: &mut impl Write, verb: &str, field: &str) -> NetworkResult<()> {
    write!(writer, "{}:{}\n", verb, field)?;
    writer.flush()?;
    Ok(())
}

/// Writes a payload frame: `VERB:<len>\n<bytes>`.
pub fn write_payload(writer: &mut impl Write, verb: &str, payload: &[u8]) -> NetworkResult<()> {
    write!(writer, "{}:{}\n", verb, payload.len())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}
