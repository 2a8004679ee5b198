//! Length-prefixed frame codec over any `Read`/`Write` stream, plus bare
//! single-datagram encoding.
//!
//! Each stream frame is: `[u32 big-endian length][postcard payload]`.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::MAX_DATAGRAM;

/// Maximum allowed frame payload (64 KiB). Helper messages are tiny.
const MAX_FRAME: u32 = 64 * 1024;

/// Encodes `msg` as a length-prefixed postcard frame and writes it to `w`.
pub fn encode<W: Write>(w: &mut W, msg: &impl Serialize) -> io::Result<()> {
    let payload =
        postcard::to_allocvec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds u32::MAX"))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(&payload)?;
    w.flush()
}

/// Reads a length-prefixed postcard frame from `r` and decodes it.
pub fn decode<T: for<'de> Deserialize<'de>>(r: &mut impl Read) -> io::Result<T> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    let len = u32::from_be_bytes(buf);
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 64 KiB limit",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    postcard::from_bytes(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Encodes `msg` into a single datagram payload (no length prefix).
pub fn encode_datagram(msg: &impl Serialize) -> io::Result<Vec<u8>> {
    let payload =
        postcard::to_allocvec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_DATAGRAM {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "datagram exceeds size limit",
        ));
    }
    Ok(payload)
}

/// Decodes one datagram payload produced by [`encode_datagram`].
pub fn decode_datagram<T: for<'de> Deserialize<'de>>(buf: &[u8]) -> io::Result<T> {
    postcard::from_bytes(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HelperError, IdentityReport};

    #[test]
    fn helper_error_survives_a_pipe() {
        let mut buf = Vec::new();
        encode(&mut buf, &HelperError::new("write uid_map", 13)).unwrap();

        let mut cursor = io::Cursor::new(&buf);
        let decoded: HelperError = decode(&mut cursor).unwrap();
        assert_eq!(decoded.op, "write uid_map");
        assert_eq!(decoded.errno, 13);
    }

    #[test]
    fn empty_pipe_is_unexpected_eof() {
        let mut cursor = io::Cursor::new(&[][..]);
        let err = decode::<HelperError>(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn identity_report_fits_one_datagram() {
        let report = IdentityReport {
            uid: 61_184,
            gid: 61_184,
            unit_id: "db.service".into(),
        };
        let bytes = encode_datagram(&report).unwrap();
        assert!(bytes.len() <= MAX_DATAGRAM);

        let decoded: IdentityReport = decode_datagram(&bytes).unwrap();
        assert_eq!(decoded, report);
    }

    #[test]
    fn oversized_unit_id_is_rejected() {
        let report = IdentityReport {
            uid: 0,
            gid: 0,
            unit_id: "x".repeat(MAX_DATAGRAM),
        };
        assert!(encode_datagram(&report).is_err());
    }

    #[test]
    fn rejects_oversized_frame() {
        let header = (1024u32 * 1024).to_be_bytes();
        let mut cursor = io::Cursor::new(&header[..]);
        let result: io::Result<HelperError> = decode(&mut cursor);
        assert!(result.is_err());
    }
}
