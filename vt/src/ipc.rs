//! IPC client — mirrors the wire framing the server's IPC socket speaks.
//!
//! Every frame is `{u32 length BE, u8 type, payload[length]}`. `vt` sends
//! `STDIN_DATA` and `CONTROL_CMD` frames and receives `OUTPUT_DATA` frames
//! carrying raw PTY bytes back.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

pub const TYPE_STDIN_DATA: u8 = 0x01;
pub const TYPE_CONTROL_CMD: u8 = 0x02;
pub const TYPE_HEARTBEAT: u8 = 0x03;
pub const TYPE_OUTPUT_DATA: u8 = 0x04;

/// Connect to a session's IPC socket.
pub async fn connect(socket_path: &std::path::Path) -> std::io::Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let stream = UnixStream::connect(socket_path).await?;
    Ok(stream.into_split())
}

pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame_type: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    #[allow(clippy::cast_possible_truncation)]
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&[frame_type]).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e);
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut type_buf = [0u8; 1];
    reader.read_exact(&mut type_buf).await?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some((type_buf[0], payload)))
}

/// Serialize a resize control command (`CONTROL_CMD`, `cmd: "resize"`).
pub fn resize_command(cols: u16, rows: u16) -> Vec<u8> {
    serde_json::json!({ "cmd": "resize", "cols": cols, "rows": rows })
        .to_string()
        .into_bytes()
}

/// Serialize a kill control command (`CONTROL_CMD`, `cmd: "kill"`).
pub fn kill_command(signal: i32) -> Vec<u8> {
    serde_json::json!({ "cmd": "kill", "signal": signal })
        .to_string()
        .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_command_is_valid_json() {
        let bytes = resize_command(100, 40);
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["cmd"], "resize");
        assert_eq!(v["cols"], 100);
        assert_eq!(v["rows"], 40);
    }
}
