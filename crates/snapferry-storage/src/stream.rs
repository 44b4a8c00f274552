//! Stream format of the in-memory driver.
//!
//! ```text
//! magic (8) | header length u32 BE | JSON header | payload[offset..total]
//! ```
//!
//! Full payloads are the snapshot content. Incremental payloads are an 8 byte
//! big endian length of the prefix shared with the base snapshot followed by
//! the remaining bytes. A resumed stream repeats the header with a non-zero
//! `offset` and carries only the bytes the receiver is missing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::driver::{StreamReader, StreamWriter};
use crate::error::{DriverError, DriverResult};

pub(crate) const STREAM_MAGIC: &[u8; 8] = b"SNAPFRY1";
const MAX_HEADER_LEN: u32 = 1 << 20;
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StreamHeader {
    /// Full name of the snapshot on the sending side.
    pub source: String,
    pub guid: u64,
    pub base_guid: Option<u64>,
    pub offset: u64,
    pub total: u64,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

/// Everything the sender needs to pick up an interrupted transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ResumeToken {
    pub source: String,
    pub guid: u64,
    pub base_guid: Option<u64>,
    pub offset: u64,
    pub total: u64,
}

impl ResumeToken {
    pub fn encode(&self) -> String {
        // Serializing a plain struct of strings and integers cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(json)
    }

    pub fn decode(token: &str) -> DriverResult<Self> {
        let bytes =
            hex::decode(token.trim()).map_err(|_| DriverError::stream("malformed resume token"))?;
        serde_json::from_slice(&bytes).map_err(|_| DriverError::stream("malformed resume token"))
    }
}

pub(crate) fn full_payload(content: &[u8]) -> Vec<u8> {
    content.to_vec()
}

pub(crate) fn incremental_payload(base: &[u8], target: &[u8]) -> Vec<u8> {
    let shared = base
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut payload = Vec::with_capacity(8 + target.len() - shared);
    payload.extend_from_slice(&(shared as u64).to_be_bytes());
    payload.extend_from_slice(&target[shared..]);
    payload
}

pub(crate) fn apply_incremental(base: &[u8], payload: &[u8]) -> DriverResult<Vec<u8>> {
    if payload.len() < 8 {
        return Err(DriverError::stream("truncated incremental payload"));
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&payload[..8]);
    let shared = u64::from_be_bytes(len) as usize;
    if shared > base.len() {
        return Err(DriverError::stream("incremental payload does not match its base"));
    }
    let mut content = Vec::with_capacity(shared + payload.len() - 8);
    content.extend_from_slice(&base[..shared]);
    content.extend_from_slice(&payload[8..]);
    Ok(content)
}

pub(crate) async fn write_stream(
    writer: &mut StreamWriter<'_>,
    header: &StreamHeader,
    payload: &[u8],
) -> DriverResult<()> {
    let header_bytes =
        serde_json::to_vec(header).map_err(|e| DriverError::stream(e.to_string()))?;
    writer.write_all(STREAM_MAGIC).await?;
    writer
        .write_all(&(header_bytes.len() as u32).to_be_bytes())
        .await?;
    writer.write_all(&header_bytes).await?;
    let start = header.offset as usize;
    for chunk in payload[start.min(payload.len())..].chunks(CHUNK_SIZE) {
        writer.write_all(chunk).await?;
    }
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_header(reader: &mut StreamReader<'_>) -> DriverResult<StreamHeader> {
    let invalid = || DriverError::stream("invalid stream header");
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic).await.map_err(|_| invalid())?;
    if &magic != STREAM_MAGIC {
        return Err(invalid());
    }
    let header_len = reader.read_u32().await.map_err(|_| invalid())?;
    if header_len > MAX_HEADER_LEN {
        return Err(invalid());
    }
    let mut header = vec![0u8; header_len as usize];
    reader.read_exact(&mut header).await.map_err(|_| invalid())?;
    let header: StreamHeader = serde_json::from_slice(&header).map_err(|_| invalid())?;
    if header.offset > header.total {
        return Err(invalid());
    }
    Ok(header)
}

/// Reads up to `expected` payload bytes into `buf`.
///
/// Returns the I/O error that ended the read early, if any. A short read with
/// no error means the sender closed the stream.
pub(crate) async fn read_payload(
    reader: &mut StreamReader<'_>,
    expected: u64,
    buf: &mut Vec<u8>,
) -> Option<std::io::Error> {
    let mut remaining = expected;
    let mut chunk = vec![0u8; CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        match reader.read(&mut chunk[..want]).await {
            Ok(0) => return None,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                remaining -= n as u64;
            }
            Err(e) => return Some(e),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_reconstructs_target() {
        let base = b"hello world".to_vec();
        let target = b"hello there, world".to_vec();
        let payload = incremental_payload(&base, &target);
        assert!(payload.len() < target.len() + 8);
        assert_eq!(apply_incremental(&base, &payload).unwrap(), target);
    }

    #[test]
    fn incremental_rejects_wrong_base() {
        let payload = incremental_payload(b"abcdefgh", b"abcdefgh-more");
        assert!(apply_incremental(b"abc", &payload).is_err());
    }

    #[test]
    fn resume_token_round_trip() {
        let token = ResumeToken {
            source: "pool/fs@s1".into(),
            guid: 42,
            base_guid: None,
            offset: 100,
            total: 1000,
        };
        let encoded = token.encode();
        assert!(encoded.len() > 32);
        assert_eq!(ResumeToken::decode(&encoded).unwrap(), token);
        assert!(ResumeToken::decode("zz").is_err());
    }

    #[tokio::test]
    async fn header_round_trip_through_pipe() {
        let header = StreamHeader {
            source: "pool/fs@s1".into(),
            guid: 7,
            base_guid: None,
            offset: 0,
            total: 5,
            props: BTreeMap::new(),
        };
        let mut out: Vec<u8> = Vec::new();
        write_stream(&mut out, &header, b"abcde").await.unwrap();

        let mut input: &[u8] = &out;
        let read = read_header(&mut input).await.unwrap();
        assert_eq!(read, header);
        let mut buf = Vec::new();
        assert!(read_payload(&mut input, 5, &mut buf).await.is_none());
        assert_eq!(buf, b"abcde");
    }

    #[tokio::test]
    async fn garbage_is_not_a_stream() {
        let mut input: &[u8] = &[0, 0, 7];
        assert!(matches!(
            read_header(&mut input).await,
            Err(DriverError::Stream { .. })
        ));
    }
}
