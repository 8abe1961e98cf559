use std::io;

use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub(crate) use self::read_ahead::ReadAhead;

mod read_ahead;

/// Writes the minimal error response the proxy emits on its own behalf:
/// a bare status line and an empty header section, no body. Status codes
/// without an IANA reason phrase collapse to `500 Internal Server Error`.
pub(crate) async fn write_error_response(
    writer: &mut (impl AsyncWrite + Send + Unpin),
    status: StatusCode,
) -> io::Result<()> {
    let (code, reason) = match status.canonical_reason() {
        Some(reason) => (status.as_u16(), reason),
        None => (500, "Internal Server Error"),
    };
    let head = format!("HTTP/1.1 {code} {reason}\r\n\r\n");
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn error_response_is_a_bare_status_line() {
        let mut out = Vec::new();
        write_error_response(&mut out, StatusCode::NOT_FOUND)
            .await
            .unwrap();
        assert_eq!(out, b"HTTP/1.1 404 Not Found\r\n\r\n");
    }

    #[tokio::test]
    async fn unknown_codes_collapse_to_500() {
        let mut out = Vec::new();
        let odd = StatusCode::from_u16(599).unwrap();
        assert!(odd.canonical_reason().is_none());
        write_error_response(&mut out, odd).await.unwrap();
        assert_eq!(out, b"HTTP/1.1 500 Internal Server Error\r\n\r\n");
    }
}
