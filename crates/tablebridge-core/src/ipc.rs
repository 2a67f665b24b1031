//! Wire framing and socket path resolution for IPC.

use std::io::{self, Read};
use std::path::PathBuf;

use thiserror::Error;

/// Default daemon socket path: `~/.local/share/tablebridge/daemon.sock`
pub fn daemon_socket_path() -> PathBuf {
    crate::config::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp/tablebridge"))
        .join("daemon.sock")
}

/// Default daemon PID file path: `~/.local/share/tablebridge/daemon.pid`
pub fn daemon_pid_path() -> PathBuf {
    crate::config::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp/tablebridge"))
        .join("daemon.pid")
}

/// Maximum frame payload size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Frame too large: {0} bytes")]
    TooLarge(usize),
}

/// Encode: 4-byte big-endian length + payload.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode one frame from a reader. Returns payload bytes.
pub fn decode_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = frame_len(len_buf)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Validate a length prefix read off the wire.
pub fn frame_len(len_buf: [u8; 4]) -> Result<usize, FrameError> {
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_carries_json_payload() {
        let data = br#"{"type":"Ping"}"#;
        let encoded = encode_frame(data);
        assert_eq!(&encoded[..4], &(data.len() as u32).to_be_bytes());
        let mut cursor = Cursor::new(encoded);
        let decoded = decode_frame(&mut cursor).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut stream = encode_frame(b"first");
        stream.extend(encode_frame(b"second"));
        let mut cursor = Cursor::new(stream);
        assert_eq!(decode_frame(&mut cursor).unwrap(), b"first");
        assert_eq!(decode_frame(&mut cursor).unwrap(), b"second");
        assert!(matches!(decode_frame(&mut cursor), Err(FrameError::Io(_))));
    }

    #[test]
    fn empty_frame() {
        let encoded = encode_frame(b"");
        let mut cursor = Cursor::new(encoded);
        let decoded = decode_frame(&mut cursor).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn too_large_frame() {
        let len = (MAX_FRAME_SIZE + 1) as u32;
        let buf = len.to_be_bytes();
        let mut cursor = Cursor::new(buf.to_vec());
        assert!(matches!(
            decode_frame(&mut cursor),
            Err(FrameError::TooLarge(_))
        ));
    }

    #[test]
    fn truncated_payload_is_io_error() {
        let mut encoded = encode_frame(b"abcdef");
        encoded.truncate(6);
        let mut cursor = Cursor::new(encoded);
        assert!(matches!(decode_frame(&mut cursor), Err(FrameError::Io(_))));
    }
}
