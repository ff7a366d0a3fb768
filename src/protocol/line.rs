//! CR terminated line I/O shared by the handshake and the turn loop.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::header::{latin1_to_string, string_to_latin1};
use crate::error::{B2FError, Result};

/// Trim whitespace and stray NUL bytes from a received line.
pub(crate) fn clean_line(line: &str) -> String {
    line.trim()
        .trim_matches('\0')
        .trim()
        .to_string()
}

/// Extract the message of a `*** text` error line, if `line` is one.
pub(crate) fn err_line(line: &str) -> Option<B2FError> {
    if !line.starts_with('*') {
        return None;
    }
    let idx = line.rfind('*')?;
    let text = line[idx + 1..].trim();
    if text.is_empty() {
        return None;
    }
    Some(B2FError::RemoteError(text.to_string()))
}

/// Next byte without consuming it. Bare LF bytes between lines are skipped.
///
/// Returns `None` at end of stream.
pub(crate) async fn peek_byte<R: AsyncBufRead + Unpin>(rd: &mut R) -> Result<Option<u8>> {
    loop {
        let first = rd.fill_buf().await?.first().copied();
        match first {
            Some(b'\n') => rd.consume(1),
            other => return Ok(other),
        }
    }
}

/// Read one CR terminated line.
///
/// With `parse_err` set, a `***` line from the remote becomes
/// [`B2FError::RemoteError`].
pub(crate) async fn read_line<R: AsyncBufRead + Unpin>(rd: &mut R, parse_err: bool) -> Result<String> {
    let mut raw = Vec::new();
    if rd.read_until(b'\r', &mut raw).await? == 0 {
        return Err(B2FError::Eof);
    }
    let line = clean_line(&latin1_to_string(&raw));
    tracing::debug!("<{}", line);

    if parse_err {
        if let Some(err) = err_line(&line) {
            return Err(err);
        }
    }
    Ok(line)
}

/// Write `line` followed by CR. The caller flushes.
pub(crate) async fn write_line<W: AsyncWrite + Unpin>(wr: &mut W, line: &str) -> Result<()> {
    tracing::debug!(">{}", line);
    let mut bytes = string_to_latin1(line);
    bytes.push(b'\r');
    wr.write_all(&bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_err_line() {
        match err_line("*** Secure login failed") {
            Some(B2FError::RemoteError(msg)) => assert_eq!(msg, "Secure login failed"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(err_line("***").is_none());
        assert!(err_line("FF").is_none());
    }

    #[test]
    fn test_clean_line() {
        assert_eq!(clean_line("\0 FF \r"), "FF");
        assert_eq!(clean_line("\nFS +\r"), "FS +");
    }

    #[tokio::test]
    async fn test_read_lines() {
        let mut rd = BufReader::new(&b"[WL2K-1-B2FHM$]\r\n;PQ: 123\r*** oops\rCMS>"[..]);
        assert_eq!(read_line(&mut rd, true).await.unwrap(), "[WL2K-1-B2FHM$]");
        assert_eq!(peek_byte(&mut rd).await.unwrap(), Some(b';'));
        assert_eq!(read_line(&mut rd, true).await.unwrap(), ";PQ: 123");
        assert!(matches!(
            read_line(&mut rd, true).await,
            Err(B2FError::RemoteError(_))
        ));
        assert_eq!(read_line(&mut rd, true).await.unwrap(), "CMS>");
        assert_eq!(peek_byte(&mut rd).await.unwrap(), None);
        assert!(read_line(&mut rd, false).await.unwrap_err().is_eof());
    }

    #[tokio::test]
    async fn test_write_line() {
        let mut out = Vec::new();
        write_line(&mut out, "FF").await.unwrap();
        assert_eq!(out, b"FF\r");
    }
}
