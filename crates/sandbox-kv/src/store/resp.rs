//! RESP2 framing: argv arrays out, typed values in.

use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, StoreError};

/// Nesting allowed in a reply; SCAN needs two levels.
pub const MAX_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resp {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Resp>>),
}

impl Resp {
    /// Surface a server error reply as [`StoreError::Server`].
    pub fn into_result(self) -> Result<Self> {
        match self {
            Self::Error(msg) => Err(StoreError::Server(msg)),
            other => Ok(other),
        }
    }

    pub fn into_integer(self) -> Result<i64> {
        match self.into_result()? {
            Self::Integer(n) => Ok(n),
            other => Err(unexpected("integer", &other)),
        }
    }

    /// Bulk or simple string; `None` for a nil bulk.
    pub fn into_string(self) -> Result<Option<String>> {
        match self.into_result()? {
            Self::Bulk(None) => Ok(None),
            Self::Bulk(Some(bytes)) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StoreError::Protocol(format!("non-UTF-8 reply: {e}"))),
            Self::Simple(s) => Ok(Some(s)),
            other => Err(unexpected("string", &other)),
        }
    }

    pub fn into_array(self) -> Result<Vec<Resp>> {
        match self.into_result()? {
            Self::Array(Some(items)) => Ok(items),
            other => Err(unexpected("array", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Resp) -> StoreError {
    StoreError::Protocol(format!("expected {wanted} reply, got {got:?}"))
}

async fn read_line<R: AsyncBufRead + Unpin + Send>(io: &mut R) -> Result<String> {
    let mut line = Vec::new();
    io.read_until(b'\n', &mut line).await?;
    if !line.ends_with(b"\r\n") {
        return Err(StoreError::Protocol("unterminated line".into()));
    }
    line.truncate(line.len().saturating_sub(2));
    String::from_utf8(line).map_err(|e| StoreError::Protocol(format!("non-UTF-8 line: {e}")))
}

fn parse_len(line: &str) -> Result<Option<usize>> {
    let n: i64 = line
        .parse()
        .map_err(|_| StoreError::Protocol(format!("bad length {line:?}")))?;
    if n < 0 {
        return Ok(None);
    }
    usize::try_from(n)
        .map(Some)
        .map_err(|_| StoreError::Protocol(format!("bad length {line:?}")))
}

/// Read one reply value.
pub fn read_value<R: AsyncBufRead + Unpin + Send>(io: &mut R, depth: usize) -> BoxFuture<'_, Result<Resp>> {
    Box::pin(async move {
        if depth == 0 {
            return Err(StoreError::Protocol("reply nested too deeply".into()));
        }
        let prefix = io.read_u8().await?;
        let line = read_line(io).await?;
        match prefix {
            b'+' => Ok(Resp::Simple(line)),
            b'-' => Ok(Resp::Error(line)),
            b':' => line
                .parse()
                .map(Resp::Integer)
                .map_err(|_| StoreError::Protocol(format!("bad integer {line:?}"))),
            b'$' => {
                let Some(len) = parse_len(&line)? else {
                    return Ok(Resp::Bulk(None));
                };
                let mut payload = vec![0u8; len + 2];
                io.read_exact(&mut payload).await?;
                if !payload.ends_with(b"\r\n") {
                    return Err(StoreError::Protocol("unterminated bulk string".into()));
                }
                payload.truncate(len);
                Ok(Resp::Bulk(Some(payload)))
            }
            b'*' => {
                let Some(len) = parse_len(&line)? else {
                    return Ok(Resp::Array(None));
                };
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(read_value(io, depth - 1).await?);
                }
                Ok(Resp::Array(Some(items)))
            }
            other => Err(StoreError::Protocol(format!(
                "unknown reply type {:?}",
                char::from(other)
            ))),
        }
    })
}

/// Write one command as an array of bulk strings and flush.
pub async fn write_argv<W: AsyncWrite + Unpin>(io: &mut W, argv: &[&[u8]]) -> Result<()> {
    let mut frame = format!("*{}\r\n", argv.len()).into_bytes();
    for arg in argv {
        frame.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        frame.extend_from_slice(arg);
        frame.extend_from_slice(b"\r\n");
    }
    io.write_all(&frame).await?;
    io.flush().await?;
    Ok(())
}
