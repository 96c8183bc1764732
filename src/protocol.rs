//! Binary wire protocol
//!
//! All integers little-endian. Requests open with a 3-byte header
//! (`op:u8, keylen:u16`) followed by the key; SET and SYNC carry an extra
//! 5-byte value header (`vallen:u32, compressed:u8`) and the value bytes.
//! Every response starts with a 5-byte header (`status:u8, datalen:u32`)
//! followed by `datalen` payload bytes.

use crate::common::{Error, Result, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const OP_GET: u8 = 0x01;
pub const OP_SET: u8 = 0x02;
pub const OP_DELETE: u8 = 0x03;
pub const OP_SYNC: u8 = 0x04;
pub const OP_HEALTH: u8 = 0x05;
pub const OP_AUTH: u8 = 0x06;

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_ERR: u8 = 0xFF;

/// Response header length: status byte plus payload length.
pub const RESPONSE_HEADER: usize = 5;

/// Decoded request header: opcode and key.
#[derive(Debug)]
pub struct RequestHeader {
    pub op: u8,
    pub key_len: usize,
}

/// Read the 3-byte request header. Returns `Ok(None)` on clean EOF before
/// the first byte, i.e. the peer closed between requests.
pub async fn read_request_header<R>(reader: &mut R) -> Result<Option<RequestHeader>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 3];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    Ok(Some(RequestHeader {
        op: header[0],
        key_len: u16::from_le_bytes([header[1], header[2]]) as usize,
    }))
}

/// Read `key_len` key bytes into `buf`, reusing its allocation.
pub async fn read_key<R>(reader: &mut R, key_len: usize, buf: &mut Vec<u8>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    buf.clear();
    buf.resize(key_len, 0);
    reader.read_exact(buf).await?;
    Ok(())
}

/// Value header carried by SET and SYNC requests.
#[derive(Debug, Clone, Copy)]
pub struct ValueHeader {
    pub len: usize,
    pub compressed: bool,
}

pub async fn read_value_header<R>(reader: &mut R) -> Result<ValueHeader>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await?;
    Ok(ValueHeader {
        len: u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize,
        compressed: header[4] == 1,
    })
}

/// Read a value payload into `buf`, reusing its allocation.
pub async fn read_value<R>(reader: &mut R, len: usize, buf: &mut Vec<u8>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    buf.clear();
    buf.resize(len, 0);
    reader.read_exact(buf).await?;
    Ok(())
}

/// Consume and discard `len` payload bytes, keeping the stream framed.
pub async fn discard_value<R>(reader: &mut R, len: usize) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut remaining = len as u64;
    let mut sink = [0u8; 8192];
    while remaining > 0 {
        let chunk = remaining.min(sink.len() as u64) as usize;
        reader.read_exact(&mut sink[..chunk]).await?;
        remaining -= chunk as u64;
    }
    Ok(())
}

pub async fn write_response<W>(writer: &mut W, status: u8, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; RESPONSE_HEADER];
    header[0] = status;
    header[1..5].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    writer.write_all(&header).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

pub async fn write_err<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_response(writer, STATUS_ERR, &[]).await
}

pub async fn write_ok<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_response(writer, STATUS_OK, &[]).await
}

/// Encode a key-only request (GET, DELETE, HEALTH, AUTH).
pub fn encode_key_request(op: u8, key: &[u8]) -> Vec<u8> {
    debug_assert!(key.len() <= MAX_KEY_SIZE);
    let mut buf = Vec::with_capacity(3 + key.len());
    buf.push(op);
    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buf.extend_from_slice(key);
    buf
}

/// Encode a SET or SYNC request around an already-encoded value payload.
pub fn encode_value_request(op: u8, key: &[u8], value: &[u8], compressed: bool) -> Vec<u8> {
    debug_assert!(value.len() <= MAX_VALUE_SIZE);
    let mut buf = Vec::with_capacity(3 + key.len() + 5 + value.len());
    buf.push(op);
    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.push(if compressed { 1 } else { 0 });
    buf.extend_from_slice(value);
    buf
}

/// Read a response header and any payload. Returns `(status, payload)`.
pub async fn read_response<R>(reader: &mut R, max_len: usize) -> Result<(u8, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; RESPONSE_HEADER];
    reader.read_exact(&mut header).await?;

    let status = header[0];
    let len = u32::from_le_bytes(header[1..5].try_into().unwrap()) as usize;
    if len > max_len {
        return Err(Error::Corrupted(format!("response payload {} too long", len)));
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload).await?;
    }
    Ok((status, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_key_request_roundtrip() {
        let encoded = encode_key_request(OP_GET, b"greeting");
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&encoded).await.unwrap();

        let header = read_request_header(&mut server).await.unwrap().unwrap();
        assert_eq!(header.op, OP_GET);
        assert_eq!(header.key_len, 8);

        let mut key = Vec::new();
        read_key(&mut server, header.key_len, &mut key).await.unwrap();
        assert_eq!(key, b"greeting");
    }

    #[tokio::test]
    async fn test_value_request_roundtrip() {
        let encoded = encode_value_request(OP_SET, b"k", b"hello", false);
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&encoded).await.unwrap();

        let header = read_request_header(&mut server).await.unwrap().unwrap();
        assert_eq!(header.op, OP_SET);

        let mut key = Vec::new();
        read_key(&mut server, header.key_len, &mut key).await.unwrap();
        assert_eq!(key, b"k");

        let value_header = read_value_header(&mut server).await.unwrap();
        assert_eq!(value_header.len, 5);
        assert!(!value_header.compressed);

        let mut value = Vec::new();
        read_value(&mut server, value_header.len, &mut value).await.unwrap();
        assert_eq!(value, b"hello");
    }

    #[tokio::test]
    async fn test_response_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_response(&mut server, STATUS_OK, b"hello").await.unwrap();

        let (status, payload) = read_response(&mut client, 1024).await.unwrap();
        assert_eq!(status, STATUS_OK);
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn test_clean_eof_between_requests() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);
        assert!(read_request_header(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_error_response_shape() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_err(&mut server).await.unwrap();

        let mut raw = [0u8; 5];
        client.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw, [0xFF, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_discard_value_keeps_framing() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        client.write_all(&vec![7u8; 20_000]).await.unwrap();
        client.write_all(&encode_key_request(OP_GET, b"next")).await.unwrap();

        discard_value(&mut server, 20_000).await.unwrap();
        let header = read_request_header(&mut server).await.unwrap().unwrap();
        assert_eq!(header.op, OP_GET);
        assert_eq!(header.key_len, 4);
    }
}
