//! Network Module
//!
//! Line-oriented TCP plumbing shared by the client, replication and
//! control planes: timed reads and writes, length-prefixed value
//! encoding, and connect helpers.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Recv/send timeout applied to every session socket. A dead peer must
/// not wedge a task; idle sessions end and peers reconnect.
pub const SESSION_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for establishing outbound connections
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to host:port with a bounded timeout
pub async fn connect(host: &str, port: u16) -> Result<TcpStream> {
    let address = format!("{}:{}", host, port);
    match timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::ConnectionFailed {
            address,
            reason: e.to_string(),
        }),
        Err(_) => Err(Error::ConnectionTimeout(address)),
    }
}

/// Read one LF-terminated line with the terminator (and any `\r`)
/// stripped. Interior whitespace is preserved: length-prefixed values
/// may carry leading or trailing spaces.
///
/// Returns `Ok(None)` on a cleanly closed connection. Timeouts and I/O
/// failures surface as errors so the session ends.
pub async fn read_line_timed<R>(reader: &mut BufReader<R>) -> Result<Option<String>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    let n = timeout(SESSION_IO_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| Error::Network("read timed out".into()))??;

    if n == 0 {
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

/// Write a full buffer with the session timeout applied
pub async fn write_all_timed<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    timeout(SESSION_IO_TIMEOUT, async {
        writer.write_all(data).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| Error::Network("write timed out".into()))??;
    Ok(())
}

/// Format a value with its length prefix: "Hello World" -> "11 Hello World"
pub fn length_prefixed(value: &str) -> String {
    format!("{} {}", value.len(), value)
}

/// Parse a length-prefixed value.
///
/// `len_token` holds the byte length; `line_rest` is the raw remainder
/// of the line, carrying as much of the value as fit on it. Values
/// containing newlines span lines, so the missing bytes (including the
/// newline the line read consumed) are taken from the reader.
pub async fn read_length_prefixed<R>(
    len_token: &str,
    line_rest: &str,
    reader: &mut BufReader<R>,
) -> Result<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let value_len: usize = len_token
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid value length: {}", len_token)))?;

    let mut buf: Vec<u8> = line_rest.as_bytes().to_vec();

    if buf.len() < value_len {
        // The line read consumed a newline that belongs to the value.
        buf.push(b'\n');
        if buf.len() < value_len {
            let mut rest = vec![0u8; value_len - buf.len()];
            timeout(SESSION_IO_TIMEOUT, reader.read_exact(&mut rest))
                .await
                .map_err(|_| Error::Network("read timed out".into()))??;
            buf.extend_from_slice(&rest);
        }
    }

    buf.truncate(value_len);
    String::from_utf8(buf).map_err(|_| Error::Protocol("value is not valid UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_prefixed_format() {
        assert_eq!(length_prefixed("Hello World"), "11 Hello World");
        assert_eq!(length_prefixed(""), "0 ");
    }

    #[tokio::test]
    async fn test_read_length_prefixed_inline() {
        let mut reader = BufReader::new(&b""[..]);
        let value = read_length_prefixed("11", "Hello World", &mut reader)
            .await
            .unwrap();
        assert_eq!(value, "Hello World");
    }

    #[tokio::test]
    async fn test_read_length_prefixed_preserves_inner_spaces() {
        let mut reader = BufReader::new(&b""[..]);
        let value = read_length_prefixed("6", "a  b  ", &mut reader).await.unwrap();
        assert_eq!(value, "a  b  ");
    }

    #[tokio::test]
    async fn test_read_length_prefixed_spanning_newline() {
        // Value "ab\ncd": the line reader stopped at the embedded newline,
        // so "cd\n" is still unread on the socket.
        let mut reader = BufReader::new(&b"cd\n"[..]);
        let value = read_length_prefixed("5", "ab", &mut reader).await.unwrap();
        assert_eq!(value, "ab\ncd");
    }

    #[tokio::test]
    async fn test_read_length_prefixed_bad_length() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_length_prefixed("abc", "x", &mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_read_line_strips_terminator_only() {
        let mut reader = BufReader::new(&b"GET key \r\n"[..]);
        assert_eq!(
            read_line_timed(&mut reader).await.unwrap(),
            Some("GET key ".to_string())
        );
        assert_eq!(read_line_timed(&mut reader).await.unwrap(), None);
    }
}
