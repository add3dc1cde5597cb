//! SFTP and SCP handler over libssh2. The sync session lives on a
//! blocking worker thread; the async side talks to it through channels.
//! SFTP reads at arbitrary offsets; SCP is stream-only and forces SINGLE.

use std::io::{Read, Seek, SeekFrom};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::probe::{ProbeResult, Validators};
use crate::target::Target;

use super::{ByteStream, HandlerCaps, HandlerConfig, ProtocolHandler, Session};

const READ_BUF: usize = 64 * 1024;
/// Data channel depth; bounds memory while the writer catches up.
const CHANNEL_DEPTH: usize = 8;

pub struct SshHandler {
    config: HandlerConfig,
}

impl SshHandler {
    pub fn new(config: &HandlerConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

struct RemoteStat {
    size: Option<u64>,
    mtime: Option<u64>,
    banner: Option<String>,
    peer_addr: SocketAddr,
}

fn resolve(target: &Target) -> Result<SocketAddr, FetchError> {
    (target.host().to_string(), target.port())
        .to_socket_addrs()
        .map_err(|e| FetchError::TransientNetwork(format!("resolve {}: {e}", target.host())))?
        .next()
        .ok_or_else(|| {
            FetchError::TransientNetwork(format!("no address for {}", target.host()))
        })
}

fn login_user(target: &Target) -> String {
    target
        .username()
        .map(str::to_string)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "root".to_string())
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(unix)]
    {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
    #[cfg(windows)]
    {
        std::env::var("USERPROFILE").ok().map(PathBuf::from)
    }
}

/// Connect, handshake and authenticate. Blocking; run under
/// `spawn_blocking` or on the session worker thread.
fn connect_blocking(
    target: &Target,
    timeout: Duration,
) -> Result<(ssh2::Session, SocketAddr), FetchError> {
    let addr = resolve(target)?;
    let tcp = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| FetchError::TransientNetwork(format!("ssh connect: {e}")))?;
    tcp.set_read_timeout(Some(timeout)).ok();
    tcp.set_write_timeout(Some(timeout)).ok();

    let mut sess = ssh2::Session::new()
        .map_err(|e| FetchError::TlsFailure(format!("ssh session init: {e}")))?;
    sess.set_tcp_stream(tcp);
    sess.handshake()
        .map_err(|e| FetchError::TlsFailure(format!("ssh handshake: {e}")))?;

    let user = login_user(target);
    if let Some(pass) = target.password() {
        sess.userauth_password(&user, pass)
            .map_err(|e| FetchError::TlsFailure(format!("ssh password auth: {e}")))?;
    } else {
        if sess.userauth_agent(&user).is_err() {
            if let Some(home) = home_dir() {
                for key in ["id_ed25519", "id_rsa"] {
                    let path = home.join(".ssh").join(key);
                    if path.exists()
                        && sess.userauth_pubkey_file(&user, None, &path, None).is_ok()
                    {
                        break;
                    }
                }
            }
        }
        if !sess.authenticated() {
            return Err(FetchError::TlsFailure(format!(
                "ssh auth failed for {user}@{}",
                target.host()
            )));
        }
    }
    Ok((sess, addr))
}

fn stat_blocking(target: &Target, timeout: Duration) -> Result<RemoteStat, FetchError> {
    let (sess, peer_addr) = connect_blocking(target, timeout)?;
    let banner = sess.banner().map(str::to_string);
    let path = PathBuf::from(target.path());

    if target.scheme() == "scp" {
        let (mut channel, stat) = sess
            .scp_recv(&path)
            .map_err(|e| FetchError::TransientNetwork(format!("scp stat: {e}")))?;
        let size = Some(stat.size());
        let _ = channel.close();
        return Ok(RemoteStat {
            size,
            mtime: None,
            banner,
            peer_addr,
        });
    }

    let sftp = sess
        .sftp()
        .map_err(|e| FetchError::TransientNetwork(format!("sftp subsystem: {e}")))?;
    let stat = sftp
        .stat(&path)
        .map_err(|e| FetchError::TransientNetwork(format!("sftp stat {}: {e}", path.display())))?;
    Ok(RemoteStat {
        size: stat.size,
        mtime: stat.mtime,
        banner,
        peer_addr,
    })
}

#[async_trait]
impl ProtocolHandler for SshHandler {
    fn schemes(&self) -> &'static [&'static str] {
        &["sftp", "scp"]
    }

    /// SFTP reads at offsets; SCP has no restart, so it advertises
    /// neither ranges nor resume.
    fn capabilities(&self, target: &Target) -> HandlerCaps {
        let seekable = target.scheme() == "sftp";
        HandlerCaps {
            supports_range: seekable,
            supports_resume: seekable,
            max_concurrent_streams: None,
        }
    }

    async fn probe(&self, target: &Target) -> Result<ProbeResult, FetchError> {
        let timeout = self.config.timeout;
        let scheme = target.scheme().to_string();
        let started = Instant::now();
        let owned = target.clone();
        let stat =
            tokio::task::spawn_blocking(move || stat_blocking(&owned, timeout))
                .await
                .map_err(|e| FetchError::TransientNetwork(format!("ssh probe task: {e}")))??;
        let latency = started.elapsed();

        let mut probe = ProbeResult::new(scheme.clone(), latency);
        probe.peer_addr = Some(stat.peer_addr);
        probe.server = stat.banner;
        probe.content_length = stat.size;
        // SFTP reads at offsets; SCP cannot.
        probe.supports_range = scheme == "sftp";
        probe.validators = Validators {
            etag: None,
            last_modified: stat.mtime.map(|m| m.to_string()),
        };
        Ok(probe)
    }

    async fn open(&self, target: &Target) -> Result<Box<dyn Session>, FetchError> {
        SshSession::spawn(target.clone(), self.config.timeout).await
    }
}

enum SshCommand {
    Read {
        offset: u64,
        limit: Option<u64>,
        data: mpsc::Sender<Result<Bytes, FetchError>>,
    },
    Close,
}

struct SshSession {
    commands: mpsc::UnboundedSender<SshCommand>,
}

impl SshSession {
    /// Establish the connection on a dedicated blocking thread and keep
    /// it there; all reads are served through the command channel.
    async fn spawn(target: Target, timeout: Duration) -> Result<Box<dyn Session>, FetchError> {
        let (commands, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("snag-ssh".into())
            .spawn(move || session_worker(target, timeout, cmd_rx, ready_tx))
            .map_err(|e| FetchError::TransientNetwork(format!("ssh worker spawn: {e}")))?;
        ready_rx
            .await
            .map_err(|_| FetchError::TransientNetwork("ssh worker died during setup".into()))??;
        Ok(Box::new(Self { commands }))
    }

    fn request(
        &self,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<mpsc::Receiver<Result<Bytes, FetchError>>, FetchError> {
        let (data, rx) = mpsc::channel(CHANNEL_DEPTH);
        self.commands
            .send(SshCommand::Read {
                offset,
                limit,
                data,
            })
            .map_err(|_| FetchError::TransientNetwork("ssh session gone".into()))?;
        Ok(rx)
    }
}

#[async_trait]
impl Session for SshSession {
    async fn read_range(&mut self, offset: u64, length: u64) -> Result<ByteStream, FetchError> {
        let rx = self.request(offset, Some(length))?;
        Ok(receiver_stream(rx))
    }

    async fn read_all(&mut self) -> Result<ByteStream, FetchError> {
        let rx = self.request(0, None)?;
        Ok(receiver_stream(rx))
    }

    async fn close(&mut self) {
        let _ = self.commands.send(SshCommand::Close);
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        let _ = self.commands.send(SshCommand::Close);
    }
}

fn receiver_stream(rx: mpsc::Receiver<Result<Bytes, FetchError>>) -> ByteStream {
    Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

/// Owns the ssh2 session for its whole life. SFTP opens the file once and
/// seeks per read; SCP replays the stream and discards up to the offset.
fn session_worker(
    target: Target,
    timeout: Duration,
    mut commands: mpsc::UnboundedReceiver<SshCommand>,
    ready: oneshot::Sender<Result<(), FetchError>>,
) {
    let sess = match connect_blocking(&target, timeout) {
        Ok((sess, _)) => {
            let _ = ready.send(Ok(()));
            sess
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let path = PathBuf::from(target.path());
    let scp = target.scheme() == "scp";

    while let Some(cmd) = commands.blocking_recv() {
        match cmd {
            SshCommand::Close => break,
            SshCommand::Read {
                offset,
                limit,
                data,
            } => {
                let result = if scp {
                    serve_scp(&sess, &path, offset, limit, &data)
                } else {
                    serve_sftp(&sess, &path, offset, limit, &data)
                };
                if let Err(e) = result {
                    let _ = data.blocking_send(Err(e));
                }
            }
        }
    }
    debug!("ssh session worker exiting");
}

fn serve_sftp(
    sess: &ssh2::Session,
    path: &std::path::Path,
    offset: u64,
    limit: Option<u64>,
    data: &mpsc::Sender<Result<Bytes, FetchError>>,
) -> Result<(), FetchError> {
    let sftp = sess
        .sftp()
        .map_err(|e| FetchError::TransientNetwork(format!("sftp subsystem: {e}")))?;
    let mut file = sftp
        .open(path)
        .map_err(|e| FetchError::TransientNetwork(format!("sftp open {}: {e}", path.display())))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| FetchError::TransientNetwork(format!("sftp seek: {e}")))?;
    pump(&mut file, limit, data, "sftp")
}

fn serve_scp(
    sess: &ssh2::Session,
    path: &std::path::Path,
    offset: u64,
    limit: Option<u64>,
    data: &mpsc::Sender<Result<Bytes, FetchError>>,
) -> Result<(), FetchError> {
    let (mut channel, _stat) = sess
        .scp_recv(path)
        .map_err(|e| FetchError::TransientNetwork(format!("scp recv: {e}")))?;
    if offset > 0 {
        // No restart offset in the protocol; drain and discard.
        warn!(offset, "scp cannot seek, discarding prefix");
        let mut to_skip = offset;
        let mut sink = vec![0u8; READ_BUF];
        while to_skip > 0 {
            let want = sink.len().min(to_skip as usize);
            let n = channel
                .read(&mut sink[..want])
                .map_err(|e| FetchError::TransientNetwork(format!("scp read: {e}")))?;
            if n == 0 {
                return Ok(());
            }
            to_skip -= n as u64;
        }
    }
    pump(&mut channel, limit, data, "scp")
}

fn pump<R: Read>(
    reader: &mut R,
    limit: Option<u64>,
    data: &mpsc::Sender<Result<Bytes, FetchError>>,
    what: &str,
) -> Result<(), FetchError> {
    let mut remaining = limit;
    loop {
        if remaining == Some(0) {
            return Ok(());
        }
        let mut buf = vec![0u8; READ_BUF];
        let want = match remaining {
            Some(rem) => buf.len().min(rem as usize),
            None => buf.len(),
        };
        let n = reader
            .read(&mut buf[..want])
            .map_err(|e| FetchError::TransientNetwork(format!("{what} read: {e}")))?;
        if n == 0 {
            return Ok(());
        }
        if let Some(rem) = remaining.as_mut() {
            *rem -= n as u64;
        }
        buf.truncate(n);
        // Receiver dropped means the read was cancelled; stop quietly.
        if data.blocking_send(Ok(Bytes::from(buf))).is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_user_prefers_url() {
        let t = Target::parse("sftp://deploy@box/a").unwrap();
        assert_eq!(login_user(&t), "deploy");
    }

    #[test]
    fn test_scheme_claims() {
        let handler = SshHandler::new(&HandlerConfig::default());
        assert!(handler.schemes().contains(&"sftp"));
        assert!(handler.schemes().contains(&"scp"));
    }

    #[test]
    fn test_capabilities_follow_scheme() {
        let handler = SshHandler::new(&HandlerConfig::default());
        let sftp = Target::parse("sftp://box/a").unwrap();
        let scp = Target::parse("scp://box/a").unwrap();
        assert!(handler.capabilities(&sftp).supports_range);
        assert!(handler.capabilities(&sftp).supports_resume);
        assert!(!handler.capabilities(&scp).supports_range);
        assert!(!handler.capabilities(&scp).supports_resume);
    }

    #[test]
    fn test_pump_respects_limit() {
        let source = vec![7u8; 1000];
        let (tx, mut rx) = mpsc::channel(32);
        pump(&mut &source[..], Some(300), &tx, "test").unwrap();
        drop(tx);
        let mut total = 0;
        while let Ok(item) = rx.try_recv() {
            total += item.unwrap().len();
        }
        assert_eq!(total, 300);
    }
}
