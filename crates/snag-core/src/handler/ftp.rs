//! FTP handler. Speaks just enough of the control protocol for probing
//! and ranged retrieval: USER/PASS, TYPE I, SIZE, MDTM, PASV, REST, RETR.
//! Ranges ride REST plus client-side truncation of the data stream.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::FetchError;
use crate::probe::{ProbeResult, Validators};
use crate::target::Target;

use super::{ByteStream, HandlerConfig, ProtocolHandler, Session};

const ANONYMOUS_USER: &str = "anonymous";
const ANONYMOUS_PASS: &str = "snag@";
const DATA_BUF: usize = 64 * 1024;

pub struct FtpHandler {
    config: HandlerConfig,
}

impl FtpHandler {
    pub fn new(config: &HandlerConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait]
impl ProtocolHandler for FtpHandler {
    fn schemes(&self) -> &'static [&'static str] {
        &["ftp"]
    }

    async fn probe(&self, target: &Target) -> Result<ProbeResult, FetchError> {
        let started = Instant::now();
        let mut conn = FtpConnection::connect(target, self.config.timeout).await?;
        let latency = started.elapsed();

        let mut probe = ProbeResult::new("ftp", latency);
        probe.peer_addr = Some(conn.peer_addr);
        probe.server = Some(conn.greeting.clone());
        probe.content_length = conn.size(target.path()).await?;
        probe.validators = Validators {
            etag: None,
            last_modified: conn.mdtm(target.path()).await?,
        };
        // REST support is the FTP notion of a restart offset.
        probe.supports_range = conn.supports_rest().await?;
        conn.quit().await;
        Ok(probe)
    }

    async fn open(&self, target: &Target) -> Result<Box<dyn Session>, FetchError> {
        let conn = FtpConnection::connect(target, self.config.timeout).await?;
        Ok(Box::new(FtpSession {
            conn: Some(conn),
            path: target.path().to_string(),
        }))
    }
}

struct FtpSession {
    conn: Option<FtpConnection>,
    path: String,
}

#[async_trait]
impl Session for FtpSession {
    async fn read_range(&mut self, offset: u64, length: u64) -> Result<ByteStream, FetchError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| FetchError::TransientNetwork("ftp session closed".into()))?;
        let data = conn.retr_from(&self.path, offset).await?;
        Ok(capped_stream(data, Some(length)))
    }

    async fn read_all(&mut self) -> Result<ByteStream, FetchError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| FetchError::TransientNetwork("ftp session closed".into()))?;
        let data = conn.retr_from(&self.path, 0).await?;
        Ok(capped_stream(data, None))
    }

    async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.quit().await;
        }
    }
}

/// Stream a data socket until EOF, or until `limit` bytes were produced.
fn capped_stream(data: TcpStream, limit: Option<u64>) -> ByteStream {
    let stream = futures_util::stream::unfold((data, limit), |(mut sock, mut limit)| async move {
        if limit == Some(0) {
            return None;
        }
        let mut buf = vec![0u8; DATA_BUF];
        match sock.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                let mut n = n;
                if let Some(rem) = limit.as_mut() {
                    if (n as u64) > *rem {
                        n = *rem as usize;
                    }
                    *rem -= n as u64;
                }
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), (sock, limit)))
            }
            Err(e) => Some((
                Err(FetchError::TransientNetwork(format!("ftp data read: {e}"))),
                (sock, limit),
            )),
        }
    });
    Box::pin(stream)
}

/// One FTP control connection.
struct FtpConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer_addr: SocketAddr,
    greeting: String,
    timeout: Duration,
    /// A RETR is outstanding; its completion reply (226, or 426 when the
    /// data socket was closed early) must be drained before the next
    /// command.
    pending_transfer: bool,
}

impl FtpConnection {
    async fn connect(target: &Target, timeout: Duration) -> Result<Self, FetchError> {
        let addr = (target.host().to_string(), target.port());
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| FetchError::TransientNetwork("ftp connect timeout".into()))?
            .map_err(|e| FetchError::TransientNetwork(format!("ftp connect: {e}")))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| FetchError::TransientNetwork(e.to_string()))?;
        let (read, writer) = stream.into_split();
        let mut conn = Self {
            reader: BufReader::new(read),
            writer,
            peer_addr,
            greeting: String::new(),
            timeout,
            pending_transfer: false,
        };

        let (code, text) = conn.read_reply().await?;
        if code != 220 {
            return Err(FetchError::TransientNetwork(format!(
                "ftp greeting {code}: {text}"
            )));
        }
        conn.greeting = text;

        let user = target.username().unwrap_or(ANONYMOUS_USER).to_string();
        let pass = target.password().unwrap_or(ANONYMOUS_PASS).to_string();
        let (code, text) = conn.command(&format!("USER {user}")).await?;
        if code == 331 {
            let (code, text) = conn.command(&format!("PASS {pass}")).await?;
            if code != 230 {
                return Err(FetchError::TransientNetwork(format!(
                    "ftp login refused {code}: {text}"
                )));
            }
        } else if code != 230 {
            return Err(FetchError::TransientNetwork(format!(
                "ftp USER refused {code}: {text}"
            )));
        }

        let (code, text) = conn.command("TYPE I").await?;
        if code != 200 {
            return Err(FetchError::TransientNetwork(format!(
                "ftp TYPE I refused {code}: {text}"
            )));
        }
        Ok(conn)
    }

    async fn command(&mut self, line: &str) -> Result<(u16, String), FetchError> {
        debug!(cmd = %line.split_whitespace().next().unwrap_or(""), "ftp command");
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .map_err(|e| FetchError::TransientNetwork(format!("ftp write: {e}")))?;
        self.read_reply().await
    }

    /// Read one reply, following multiline continuation ("123-...").
    async fn read_reply(&mut self) -> Result<(u16, String), FetchError> {
        let mut pending: Option<(u16, String)> = None;
        loop {
            let mut line = String::new();
            let read = tokio::time::timeout(self.timeout, self.reader.read_line(&mut line))
                .await
                .map_err(|_| FetchError::TransientNetwork("ftp reply timeout".into()))?
                .map_err(|e| FetchError::TransientNetwork(format!("ftp read: {e}")))?;
            if read == 0 {
                return Err(FetchError::TransientNetwork("ftp connection closed".into()));
            }
            let line = line.trim_end().to_string();
            let code = if line.len() >= 4 {
                line[..3].parse::<u16>().ok()
            } else {
                None
            };
            let sep = line.as_bytes().get(3).copied();

            // Terminator: matching code followed by a space.
            if let (Some(code), Some(b' ')) = (code, sep) {
                let matches_start = pending.as_ref().map_or(true, |(start, _)| *start == code);
                if matches_start {
                    let text = match pending.take() {
                        Some((_, text)) => text,
                        None => line[4..].to_string(),
                    };
                    return Ok((code, text));
                }
            }
            // Start of a multiline reply.
            if pending.is_none() {
                match (code, sep) {
                    (Some(code), Some(b'-')) => {
                        pending = Some((code, line[4..].to_string()));
                    }
                    _ => {
                        return Err(FetchError::TransientNetwork(format!(
                            "ftp malformed reply: {line}"
                        )));
                    }
                }
            }
            // Anything else is continuation content inside a multiline
            // reply; keep reading.
        }
    }

    async fn size(&mut self, path: &str) -> Result<Option<u64>, FetchError> {
        let (code, text) = self.command(&format!("SIZE {path}")).await?;
        if code == 213 {
            return Ok(text.trim().parse().ok());
        }
        Ok(None)
    }

    async fn mdtm(&mut self, path: &str) -> Result<Option<String>, FetchError> {
        let (code, text) = self.command(&format!("MDTM {path}")).await?;
        if code == 213 {
            return Ok(Some(text.trim().to_string()));
        }
        Ok(None)
    }

    async fn supports_rest(&mut self) -> Result<bool, FetchError> {
        let (code, _) = self.command("REST 0").await?;
        Ok(code == 350)
    }

    /// Enter passive mode, issue REST + RETR, hand back the data socket.
    async fn retr_from(&mut self, path: &str, offset: u64) -> Result<TcpStream, FetchError> {
        if self.pending_transfer {
            let _ = self.read_reply().await;
            self.pending_transfer = false;
        }
        let (code, text) = self.command("PASV").await?;
        if code != 227 {
            return Err(FetchError::TransientNetwork(format!(
                "ftp PASV refused {code}: {text}"
            )));
        }
        let addr = parse_pasv(&text).ok_or_else(|| {
            FetchError::TransientNetwork(format!("ftp unparsable PASV reply: {text}"))
        })?;
        let data = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| FetchError::TransientNetwork("ftp data connect timeout".into()))?
            .map_err(|e| FetchError::TransientNetwork(format!("ftp data connect: {e}")))?;

        if offset > 0 {
            let (code, text) = self.command(&format!("REST {offset}")).await?;
            if code != 350 {
                return Err(FetchError::ProtocolDegraded(format!(
                    "ftp REST refused {code}: {text}"
                )));
            }
        }
        let (code, text) = self.command(&format!("RETR {path}")).await?;
        if code != 150 && code != 125 {
            return Err(FetchError::TransientNetwork(format!(
                "ftp RETR refused {code}: {text}"
            )));
        }
        self.pending_transfer = true;
        Ok(data)
    }

    async fn quit(&mut self) {
        let _ = self.writer.write_all(b"QUIT\r\n").await;
    }
}

/// Pull `(h1,h2,h3,h4,p1,p2)` out of a 227 reply.
fn parse_pasv(text: &str) -> Option<SocketAddr> {
    let open = text.find('(')?;
    let close = text[open..].find(')')? + open;
    let parts: Vec<u16> = text[open + 1..close]
        .split(',')
        .map(|p| p.trim().parse::<u16>())
        .collect::<Result<_, _>>()
        .ok()?;
    if parts.len() != 6 || parts[..4].iter().any(|&b| b > 255) || parts[4] > 255 || parts[5] > 255 {
        return None;
    }
    let ip = std::net::Ipv4Addr::new(
        parts[0] as u8,
        parts[1] as u8,
        parts[2] as u8,
        parts[3] as u8,
    );
    Some(SocketAddr::from((ip, parts[4] * 256 + parts[5])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pasv_reply() {
        let addr =
            parse_pasv("Entering Passive Mode (192,168,1,10,19,137).").unwrap();
        assert_eq!(addr.to_string(), "192.168.1.10:5001");
    }

    #[test]
    fn test_parse_pasv_rejects_garbage() {
        assert!(parse_pasv("no numbers here").is_none());
        assert!(parse_pasv("(1,2,3)").is_none());
        assert!(parse_pasv("(999,2,3,4,5,6)").is_none());
    }

    #[tokio::test]
    async fn test_capped_stream_limits_bytes() {
        use futures_util::StreamExt;
        // Loopback socket pair: writer floods, stream must stop at the cap.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        tokio::spawn(async move {
            let payload = vec![0xabu8; 10_000];
            let _ = server.write_all(&payload).await;
        });

        let mut stream = capped_stream(client, Some(4096));
        let mut got = 0u64;
        while let Some(item) = stream.next().await {
            got += item.unwrap().len() as u64;
        }
        assert_eq!(got, 4096);
    }
}
