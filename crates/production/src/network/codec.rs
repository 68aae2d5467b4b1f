//! Async frame I/O.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use trellis_messages::{Opcode, RawFrame, MAX_FRAME_LEN};

/// Errors from frame I/O.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("frame body of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
}

/// Read one frame: header first, body second. The body stays unparsed.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<RawFrame, NetError> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await?;
    let opcode = Opcode::from_byte(header[0]).ok_or(NetError::UnknownOpcode(header[0]))?;
    let len = u32::from_le_bytes(header[1..5].try_into().expect("4 bytes")) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NetError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(RawFrame { opcode, body })
}

/// Write pre-encoded frame bytes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<(), NetError> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_messages::{ReqBlock, WireMessage};
    use trellis_types::Hash;

    #[tokio::test]
    async fn frame_round_trip_over_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let req = ReqBlock {
            block_hashes: vec![Hash::digest(b"wanted")],
        };
        write_frame(&mut a, &req.to_frame()).await.unwrap();

        let frame = read_frame(&mut b).await.unwrap();
        assert_eq!(frame.opcode, Opcode::ReqBlock);
        let back: ReqBlock = frame.parse().unwrap();
        assert_eq!(back, req);
    }

    #[tokio::test]
    async fn unknown_opcode_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0xEE, 0, 0, 0, 0]).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, NetError::UnknownOpcode(0xEE)));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut header = vec![0u8];
        header.extend_from_slice(&u32::MAX.to_le_bytes());
        a.write_all(&header).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, NetError::FrameTooLarge(_)));
    }
}
