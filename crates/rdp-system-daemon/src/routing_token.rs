use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Total wall-clock budget for one peek (§5: "~2 s").
pub const PEEK_BUDGET: Duration = Duration::from_secs(2);

/// MS-RDPBCGR `requestedProtocols` bit for RDSTLS.
const PROTOCOL_RDSTLS: u32 = 0x0000_0004;

/// Result of peeking the first TPKT PDU of a connection (§3/§4.8).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTokenInfo {
    pub requested_rdstls: bool,
    pub routing_token: Option<String>,
}

/// Errors surfaced while peeking; all are `Cancelled` or `Failed` in the §7
/// taxonomy — a malformed/absent handshake just means "not a handover
/// client", not a protocol violation worth distinguishing further here.
#[derive(Debug, thiserror::Error)]
pub enum RoutingTokenPeekError {
    #[error("peek cancelled")]
    Cancelled,
    #[error("peek timed out after {0:?}")]
    TimedOut(Duration),
    #[error("socket error while peeking: {0}")]
    Io(#[source] std::io::Error),
    #[error("unsupported TPKT version {0} (expected 3)")]
    BadTpktVersion(u8),
    #[error("TPKT length {0} too small (expected >= 11)")]
    TpktTooSmall(u16),
    #[error("X.224 length indicator mismatch: got {0}, expected {1}")]
    BadLengthIndicator(u8, u8),
    #[error("not an X.224 Connection Request (CR/CDT byte = 0x{0:02x})")]
    NotConnectionRequest(u8),
    #[error("X.224 DST-REF must be 0, got {0}")]
    BadDstRef(u16),
    #[error("X.224 CLASS/OPTION byte has reserved bits set: 0x{0:02x}")]
    BadClassOption(u8),
}

/// Peek the first TPKT PDU on `stream` without consuming any bytes, and
/// extract the handover routing token / RDSTLS negotiation bit if present.
///
/// `cancel` is observed between each poll attempt; triggering it at any
/// point aborts the peek with [`RoutingTokenPeekError::Cancelled`].
pub async fn peek(
    stream: &TcpStream,
    cancel: &CancellationToken,
) -> Result<RoutingTokenInfo, RoutingTokenPeekError> {
    let deadline = Instant::now() + PEEK_BUDGET;

    let header = peek_exact(stream, 4, deadline, cancel).await?;
    if header[0] != 3 {
        return Err(RoutingTokenPeekError::BadTpktVersion(header[0]));
    }
    let tpkt_length = u16::from_be_bytes([header[2], header[3]]);
    if tpkt_length < 11 {
        return Err(RoutingTokenPeekError::TpktTooSmall(tpkt_length));
    }

    let buf = peek_exact(stream, usize::from(tpkt_length), deadline, cancel).await?;
    verify_x224_cr(&buf, tpkt_length)?;

    Ok(parse_cookie_and_negreq(&buf[11..]))
}

fn verify_x224_cr(buf: &[u8], tpkt_length: u16) -> Result<(), RoutingTokenPeekError> {
    let length_indicator = buf[4];
    let expected = u8::try_from(tpkt_length.saturating_sub(5)).unwrap_or(u8::MAX);
    if length_indicator != expected {
        return Err(RoutingTokenPeekError::BadLengthIndicator(length_indicator, expected));
    }

    let cr_cdt = buf[5];
    if cr_cdt != 0xE0 {
        return Err(RoutingTokenPeekError::NotConnectionRequest(cr_cdt));
    }

    let dst_ref = u16::from_be_bytes([buf[6], buf[7]]);
    if dst_ref != 0 {
        return Err(RoutingTokenPeekError::BadDstRef(dst_ref));
    }

    let class_opt = buf[10];
    if class_opt & 0xFC != 0 {
        return Err(RoutingTokenPeekError::BadClassOption(class_opt));
    }

    Ok(())
}

fn parse_cookie_and_negreq(rest: &[u8]) -> RoutingTokenInfo {
    const PREFIX: &[u8] = b"Cookie: msts=";

    let Some(prefix_at) = find(rest, PREFIX) else {
        return RoutingTokenInfo { requested_rdstls: false, routing_token: None };
    };
    let token_start = prefix_at + PREFIX.len();
    let tail = &rest[token_start..];
    let Some(crlf_at) = find(tail, b"\r\n") else {
        return RoutingTokenInfo { requested_rdstls: false, routing_token: None };
    };

    let routing_token = std::str::from_utf8(&tail[..crlf_at]).ok().map(str::to_string);
    let after_crlf = &tail[crlf_at + 2..];

    let requested_rdstls = after_crlf.len() >= 8
        && after_crlf[0] == 0x01
        && {
            let requested_protocols =
                u32::from_le_bytes([after_crlf[4], after_crlf[5], after_crlf[6], after_crlf[7]]);
            requested_protocols & PROTOCOL_RDSTLS != 0
        };

    RoutingTokenInfo { requested_rdstls, routing_token }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Peek exactly `n` bytes, polling until the OS socket buffer has that many
/// available, the deadline passes, or `cancel` is triggered.
async fn peek_exact(
    stream: &TcpStream,
    n: usize,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, RoutingTokenPeekError> {
    let mut buf = vec![0u8; n];
    loop {
        let got = stream.peek(&mut buf).await.map_err(RoutingTokenPeekError::Io)?;
        if got >= n {
            return Ok(buf);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RoutingTokenPeekError::TimedOut(PEEK_BUDGET));
        }

        tokio::select! {
            () = cancel.cancelled() => return Err(RoutingTokenPeekError::Cancelled),
            () = tokio::time::sleep(remaining.min(Duration::from_millis(20))) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    fn sample_pdu(cookie: &[u8], negreq: &[u8]) -> Vec<u8> {
        let mut x224 = vec![0u8; 7];
        x224[1] = 0xE0; // CR/CDT
        x224.extend_from_slice(cookie);
        x224.extend_from_slice(negreq);
        x224[0] = u8::try_from(x224.len() - 1).unwrap();

        let total_len = 4 + x224.len();
        let mut pdu = vec![3, 0];
        pdu.extend_from_slice(&u16::try_from(total_len).unwrap().to_be_bytes());
        pdu.extend_from_slice(&x224);
        pdu
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn extracts_token_and_rdstls_bit() {
        let (server, mut client) = connected_pair().await;
        let negreq = [0x01, 0x00, 0x08, 0x00, 0x04, 0x00, 0x00, 0x00];
        let pdu = sample_pdu(b"Cookie: msts=17\r\n", &negreq);
        client.write_all(&pdu).await.unwrap();

        let cancel = CancellationToken::new();
        let info = peek(&server, &cancel).await.unwrap();
        assert_eq!(info.routing_token, Some("17".to_string()));
        assert!(info.requested_rdstls);
    }

    #[tokio::test]
    async fn peek_does_not_consume_bytes() {
        let (server, mut client) = connected_pair().await;
        let negreq = [0x01, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00];
        let pdu = sample_pdu(b"Cookie: msts=42\r\n", &negreq);
        client.write_all(&pdu).await.unwrap();

        let cancel = CancellationToken::new();
        let _ = peek(&server, &cancel).await.unwrap();

        let mut read_back = vec![0u8; pdu.len()];
        let mut server = server;
        server.read_exact(&mut read_back).await.unwrap();
        assert_eq!(read_back, pdu);
    }

    #[tokio::test]
    async fn no_cookie_is_not_an_error() {
        let (server, mut client) = connected_pair().await;
        let pdu = sample_pdu(b"", &[]);
        client.write_all(&pdu).await.unwrap();

        let cancel = CancellationToken::new();
        let info = peek(&server, &cancel).await.unwrap();
        assert_eq!(info, RoutingTokenInfo { requested_rdstls: false, routing_token: None });
    }

    #[tokio::test]
    async fn bad_version_is_rejected() {
        let (server, mut client) = connected_pair().await;
        client.write_all(&[4, 0, 0, 11, 0, 0, 0, 0, 0, 0, 0]).await.unwrap();

        let cancel = CancellationToken::new();
        let err = peek(&server, &cancel).await.unwrap_err();
        assert!(matches!(err, RoutingTokenPeekError::BadTpktVersion(4)));
    }
}
