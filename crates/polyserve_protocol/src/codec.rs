//! Async frame codec over any ordered byte stream.
//!
//! Reads and writes [`Message`] frames on the transport between the
//! dispatcher and a worker (stdio pipes in production, in-memory duplex
//! streams in tests).

use crate::error::{ProtocolError, Result};
use crate::{Header, Message, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Write one frame and flush.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = msg.pack()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on clean EOF at a frame boundary;
/// EOF mid-frame is an error.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::HeaderTooShort {
                expected: HEADER_SIZE,
                got: filled,
            });
        }
        filled += n;
    }

    let header = Header::unpack(&header_buf)?;
    let len = header.payload_len as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Message { header, payload }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OpCode;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let id = Uuid::new_v4();
        let msg = Message::new(OpCode::Request, id, b"{\"uri\":\"/\"}".to_vec()).unwrap();
        write_message(&mut a, &msg).await.unwrap();

        let got = read_message(&mut b).await.unwrap().unwrap();
        assert_eq!(got.header.opcode, OpCode::Request);
        assert_eq!(got.header.req_id, id);
        assert_eq!(got.payload, msg.payload);
    }

    #[tokio::test]
    async fn test_eof_at_boundary_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_message(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0x01, 0x02, 0x00]).await.unwrap();
        drop(a);
        assert!(read_message(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let first = Message::lifecycle(OpCode::Idle);
        let second = Message::lifecycle(OpCode::Terminate);
        write_message(&mut a, &first).await.unwrap();
        write_message(&mut a, &second).await.unwrap();

        let got1 = read_message(&mut b).await.unwrap().unwrap();
        let got2 = read_message(&mut b).await.unwrap().unwrap();
        assert_eq!(got1.header.opcode, OpCode::Idle);
        assert_eq!(got2.header.opcode, OpCode::Terminate);
    }
}
