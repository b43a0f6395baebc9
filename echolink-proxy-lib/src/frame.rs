//! The 9-byte packed header framing protocol spoken between proxy and
//! client: `type: u8, address: u32 LE, size: u32 LE`, followed by
//! exactly `size` bytes of payload.

use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, Result};

/// Packs an IPv4 address into the frame header's `address` field. The
/// four octets become the four wire bytes in order; since the header
/// is decoded with `from_le_bytes`, this is its exact inverse.
pub fn ipv4_to_address(ip: Ipv4Addr) -> u32 {
    u32::from_le_bytes(ip.octets())
}

/// Unpacks a frame header's `address` field back into the IPv4 address
/// whose octets it carries.
pub fn address_to_ipv4(address: u32) -> Ipv4Addr {
    let bytes = address.to_le_bytes();
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

/// Wire size of the fixed header, in bytes.
pub const HEADER_LEN: usize = 9;

/// The largest payload chunk the framer will buffer for a single
/// `recv`/`send` before splitting. `4096 - HEADER_LEN`: a whole frame
/// with this payload fills exactly one 4 KiB buffer.
pub const MAX_CHUNK: usize = 4096 - HEADER_LEN;

/// Message type codes, client ↔ proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    TcpOpen = 1,
    TcpData = 2,
    TcpClose = 3,
    TcpStatus = 4,
    UdpData = 5,
    UdpControl = 6,
    System = 7,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => MessageType::TcpOpen,
            2 => MessageType::TcpData,
            3 => MessageType::TcpClose,
            4 => MessageType::TcpStatus,
            5 => MessageType::UdpData,
            6 => MessageType::UdpControl,
            7 => MessageType::System,
            _ => return None,
        })
    }
}

/// System-message sub-codes (single-byte payload of a `SYSTEM` frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCode {
    BadPassword = 1,
    AccessDenied = 2,
}

/// A decoded frame header: wire byte layout without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: MessageType,
    pub address: u32,
    pub size: u32,
}

impl FrameHeader {
    pub fn encode(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.msg_type as u8;
        buf[1..5].copy_from_slice(&self.address.to_le_bytes());
        buf[5..9].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        let msg_type = MessageType::from_u8(buf[0])
            .ok_or_else(|| ProxyError::InvalidFrame(format!("unknown message type {}", buf[0])))?;
        let address = u32::from_le_bytes(buf[1..5].try_into().unwrap());
        let size = u32::from_le_bytes(buf[5..9].try_into().unwrap());
        Ok(FrameHeader { msg_type, address, size })
    }
}

/// Reads exactly one header from `stream`. A short read (EOF before 9
/// bytes) is classified via [`ProxyError::classify_peer_io`] so a
/// clean client disconnect doesn't read as an error-level event.
pub async fn read_header<R: AsyncRead + Unpin>(stream: &mut R) -> Result<FrameHeader> {
    let mut buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut buf).await.map_err(ProxyError::classify_peer_io)?;
    FrameHeader::decode(&buf)
}

/// Writes a full frame (header + payload) to `stream` in one logical
/// write. Callers holding a slot's send-mutex call this once per
/// frame; the mutex must span exactly this call, nothing more.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    msg_type: MessageType,
    address: u32,
    payload: &[u8],
) -> Result<()> {
    let header = FrameHeader { msg_type, address, size: payload.len() as u32 };
    stream.write_all(&header.encode()).await.map_err(ProxyError::classify_peer_io)?;
    if !payload.is_empty() {
        stream.write_all(payload).await.map_err(ProxyError::classify_peer_io)?;
    }
    Ok(())
}

/// Reads `size` bytes from `stream` in chunks of at most [`MAX_CHUNK`],
/// invoking `on_chunk` with each chunk as it arrives. Used to stream a
/// frame's payload without buffering the whole thing when `size` is
/// large (TCP_DATA, UDP_DATA, UDP_CONTROL).
pub async fn stream_payload<R, F, Fut>(stream: &mut R, size: u32, mut on_chunk: F) -> Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(Vec<u8>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut remaining = size as usize;
    let mut buf = vec![0u8; MAX_CHUNK.min(size.max(1) as usize)];
    while remaining > 0 {
        let take = remaining.min(MAX_CHUNK);
        buf.resize(take, 0);
        stream.read_exact(&mut buf[..take]).await.map_err(ProxyError::classify_peer_io)?;
        on_chunk(buf[..take].to_vec()).await?;
        remaining -= take;
    }
    Ok(())
}

/// Drains (discards) `size` bytes from `stream`, still chunked at
/// [`MAX_CHUNK`]. Used after an outbound write failure so the client's
/// TCP stream stays frame-aligned even though we're not forwarding.
pub async fn drain_payload<R: AsyncRead + Unpin>(stream: &mut R, size: u32) -> Result<()> {
    stream_payload(stream, size, |_chunk| async { Ok(()) }).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        for (t, addr, size) in [
            (MessageType::TcpOpen, 0u32, 0u32),
            (MessageType::TcpData, 0xdead_beef, 4087),
            (MessageType::UdpData, 0x7f00_0001, u32::MAX),
            (MessageType::System, 1, 1),
        ] {
            let header = FrameHeader { msg_type: t, address: addr, size };
            let encoded = header.encode();
            let decoded = FrameHeader::decode(&encoded).unwrap();
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn header_encoding_is_little_endian() {
        let header = FrameHeader { msg_type: MessageType::TcpOpen, address: 0x0102_0304, size: 5 };
        let encoded = header.encode();
        assert_eq!(encoded[0], 1);
        assert_eq!(&encoded[1..5], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&encoded[5..9], &[5, 0, 0, 0]);
    }

    #[test]
    fn address_ipv4_round_trips() {
        for ip in [Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(216, 31, 1, 1), Ipv4Addr::UNSPECIFIED] {
            assert_eq!(address_to_ipv4(ipv4_to_address(ip)), ip);
        }
    }

    #[test]
    fn unknown_type_is_invalid_frame() {
        let buf = [0u8, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(FrameHeader::decode(&buf), Err(ProxyError::InvalidFrame(_))));
        let buf = [8u8, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(FrameHeader::decode(&buf), Err(ProxyError::InvalidFrame(_))));
    }

    #[tokio::test]
    async fn write_then_read_header() {
        let (mut client, mut server) = tokio::io::duplex(8192);
        write_frame(&mut client, MessageType::TcpStatus, 0, &[0, 0, 0, 0]).await.unwrap();
        let header = read_header(&mut server).await.unwrap();
        assert_eq!(header.msg_type, MessageType::TcpStatus);
        assert_eq!(header.size, 4);
        let mut payload = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut payload).await.unwrap();
        assert_eq!(payload, [0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn stream_payload_chunks_large_frames() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        let (mut client, mut server) = tokio::io::duplex(20_000);
        let write_data = data.clone();
        let writer = tokio::spawn(async move {
            tokio::io::AsyncWriteExt::write_all(&mut client, &write_data).await.unwrap();
        });
        let mut received = Vec::new();
        stream_payload(&mut server, data.len() as u32, |chunk| {
            received.extend_from_slice(&chunk);
            async { Ok(()) }
        })
        .await
        .unwrap();
        writer.await.unwrap();
        assert_eq!(received, data);
    }
}
