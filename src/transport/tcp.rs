//! TCP ("telnet") transport.
//!
//! Plain TCP with the Winlink login preamble: the server prompts with
//! `Callsign :` and `Password :`, each answered with a CR terminated line.
//! After that the connection carries a B2F exchange unchanged.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

use super::{Acceptor, BoxFuture, BoxStream, ByteStream, Dialer, TransportListener};
use crate::error::{B2FError, Result};

/// Target callsign of the Winlink CMS
pub const CMS_TARGET_CALL: &str = "wl2k";
/// Password expected by CMS telnet servers
pub const CMS_PASSWORD: &str = "CMSTelnet";
/// Public CMS telnet address
pub const CMS_ADDRESS: &str = "server.winlink.org:8772";

const DEFAULT_PORT: u16 = 8772;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Logged in telnet connection
pub struct TelnetStream {
    inner: BufReader<TcpStream>,
    remote_call: String,
    remote_addr: String,
    local_addr: String,
}

impl TelnetStream {
    fn new(tcp: TcpStream, remote_call: String) -> Self {
        let remote_addr = tcp.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        let local_addr = tcp.local_addr().map(|a| a.to_string()).unwrap_or_default();
        Self {
            inner: BufReader::new(tcp),
            remote_call,
            remote_addr,
            local_addr,
        }
    }
}

impl AsyncRead for TelnetStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TelnetStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl ByteStream for TelnetStream {
    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn remote_call(&self) -> Option<&str> {
        Some(&self.remote_call)
    }
}

async fn read_prompt_line(rd: &mut BufReader<TcpStream>) -> Result<String> {
    let mut raw = Vec::new();
    if rd.read_until(b'\r', &mut raw).await? == 0 {
        return Err(B2FError::Network("connection closed during telnet login".to_string()));
    }
    Ok(String::from_utf8_lossy(&raw).trim().to_string())
}

/// Dials `telnet://[user[:password]@]host[:port][/target]` URLs.
#[derive(Debug, Clone)]
pub struct TelnetDialer {
    mycall: String,
}

impl TelnetDialer {
    /// Log in as `mycall` unless the URL names a user.
    pub fn new(mycall: &str) -> Self {
        Self {
            mycall: mycall.to_string(),
        }
    }

    async fn connect(&self, url: &Url) -> Result<BoxStream> {
        let host = url
            .host_str()
            .ok_or_else(|| B2FError::Parse(format!("missing host in '{url}'")))?;
        let port = url.port().unwrap_or(DEFAULT_PORT);
        let user = if url.username().is_empty() {
            self.mycall.as_str()
        } else {
            url.username()
        };
        let password = url.password().unwrap_or(CMS_PASSWORD);
        let target = match url.path().trim_matches('/') {
            "" => CMS_TARGET_CALL,
            path => path,
        };

        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| B2FError::Network(format!("timed out connecting to {host}:{port}")))??;

        let mut stream = TelnetStream::new(tcp, target.to_string());
        loop {
            let line = read_prompt_line(&mut stream.inner).await?.to_lowercase();
            if line.starts_with("callsign") {
                stream.inner.write_all(format!("{user}\r").as_bytes()).await?;
                stream.inner.flush().await?;
            } else if line.starts_with("password") {
                stream.inner.write_all(format!("{password}\r").as_bytes()).await?;
                stream.inner.flush().await?;
                break;
            }
        }

        tracing::info!("Logged in to {} as {}", stream.remote_addr, user);
        Ok(Box::new(stream))
    }
}

impl Dialer for TelnetDialer {
    fn scheme(&self) -> &'static str {
        "telnet"
    }

    fn dial<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<BoxStream>> {
        Box::pin(self.connect(url))
    }
}

/// Accepts telnet logins on a TCP address.
#[derive(Debug, Clone)]
pub struct TelnetListener {
    listen_addr: String,
}

impl TelnetListener {
    /// Create a listener for `addr` (e.g. `0.0.0.0:8774`).
    pub fn new(addr: &str) -> Self {
        Self {
            listen_addr: addr.to_string(),
        }
    }

    /// Bind the TCP socket.
    pub async fn bind(&self) -> Result<TelnetAcceptor> {
        let listener = TcpListener::bind(&self.listen_addr).await.map_err(|e| {
            B2FError::Network(format!("Failed to bind telnet listener to {}: {}", self.listen_addr, e))
        })?;
        Ok(TelnetAcceptor { listener })
    }
}

impl TransportListener for TelnetListener {
    fn name(&self) -> &'static str {
        "telnet"
    }

    fn listen_addr(&self) -> String {
        self.listen_addr.clone()
    }

    fn init(&self) -> BoxFuture<'_, Result<Box<dyn Acceptor>>> {
        Box::pin(async move {
            let acceptor = self.bind().await?;
            Ok(Box::new(acceptor) as Box<dyn Acceptor>)
        })
    }
}

/// Bound telnet listener
pub struct TelnetAcceptor {
    listener: TcpListener,
}

impl TelnetAcceptor {
    /// Address actually bound
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    async fn accept_login(&mut self) -> Result<BoxStream> {
        let (tcp, peer) = self.listener.accept().await?;
        let mut stream = TelnetStream::new(tcp, String::new());

        stream.inner.write_all(b"Callsign :\r").await?;
        stream.inner.flush().await?;
        stream.remote_call = read_prompt_line(&mut stream.inner).await?;

        stream.inner.write_all(b"Password :\r").await?;
        stream.inner.flush().await?;
        // Password is read and discarded.
        read_prompt_line(&mut stream.inner).await?;

        tracing::info!("Telnet login from {} ({})", stream.remote_call, peer);
        Ok(Box::new(stream))
    }
}

impl Acceptor for TelnetAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, Result<BoxStream>> {
        Box::pin(self.accept_login())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_telnet_names() {
        assert_eq!(TelnetDialer::new("LA5NTA").scheme(), "telnet");
        let listener = TelnetListener::new("127.0.0.1:8774");
        assert_eq!(listener.name(), "telnet");
        assert_eq!(listener.listen_addr(), "127.0.0.1:8774");
    }

    #[tokio::test]
    async fn test_login_loopback() {
        let mut acceptor = TelnetListener::new("127.0.0.1:0").bind().await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut stream = acceptor.accept().await.unwrap();
            assert_eq!(stream.remote_call(), Some("LA5NTA"));
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let url = Url::parse(&format!("telnet://{addr}/LA1B")).unwrap();
        let mut stream = TelnetDialer::new("LA5NTA").dial(&url).await.unwrap();
        assert_eq!(stream.remote_call(), Some("LA1B"));
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(&server.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_dial_refused_while_logging_in() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            tcp.write_all(b"Callsign :\r").await.unwrap();
            let mut call = [0u8; 7];
            tcp.read_exact(&mut call).await.unwrap();
        });

        let url = Url::parse(&format!("telnet://{addr}")).unwrap();
        let result = TelnetDialer::new("LA5NTA").dial(&url).await;
        assert!(matches!(result, Err(B2FError::Network(_))));
    }
}
