#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use avail::config::{CheckConfig, Config, TargetConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, sleep};

/// Minimal HTTP/1.1 server answering every request with a configurable
/// status. Absolute-form request lines are accepted too, so it doubles as a
/// forward proxy.
pub struct TestServer {
    pub port: u16,
    status: Arc<AtomicU16>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    pub async fn start(status: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let status = Arc::new(AtomicU16::new(status));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let (shared_status, shared_requests) = (status.clone(), requests.clone());
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                tokio::spawn(serve(stream, shared_status.clone(), shared_requests.clone()));
            }
        });

        Self { port, status, requests }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    /// Request lines received so far
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve(mut stream: TcpStream, status: Arc<AtomicU16>, requests: Arc<Mutex<Vec<String>>>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let request_line = head.lines().next().unwrap_or_default().to_string();
    requests.lock().unwrap().push(request_line);

    let status = status.load(Ordering::SeqCst);
    let response = format!(
        "HTTP/1.1 {status} Test\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// SOCKS5 proxy that accepts username/password or no authentication, records
/// every CONNECT, then answers HTTP on the tunnel itself instead of dialing out.
pub struct Socks5Proxy {
    pub port: u16,
    connects: Arc<Mutex<Vec<String>>>,
    credentials: Arc<Mutex<Vec<(String, String)>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl Socks5Proxy {
    pub async fn start(status: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let proxy = Self {
            port,
            connects: Arc::default(),
            credentials: Arc::default(),
            requests: Arc::default(),
        };

        let status = Arc::new(AtomicU16::new(status));
        let (connects, credentials, requests) =
            (proxy.connects.clone(), proxy.credentials.clone(), proxy.requests.clone());
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let session = Socks5Session {
                    connects: connects.clone(),
                    credentials: credentials.clone(),
                };
                let (status, requests) = (status.clone(), requests.clone());
                tokio::spawn(async move {
                    if let Ok(stream) = session.handshake(stream).await {
                        serve(stream, status, requests).await;
                    }
                });
            }
        });

        proxy
    }

    /// `host:port` of every CONNECT request
    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().unwrap().clone()
    }

    /// Username and password of every authenticated session
    pub fn credentials(&self) -> Vec<(String, String)> {
        self.credentials.lock().unwrap().clone()
    }

    /// HTTP request lines received through the tunnel
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

struct Socks5Session {
    connects: Arc<Mutex<Vec<String>>>,
    credentials: Arc<Mutex<Vec<(String, String)>>>,
}

impl Socks5Session {
    const VERSION: u8 = 0x05;
    const NO_AUTH: u8 = 0x00;
    const USER_PASS: u8 = 0x02;

    async fn handshake(&self, mut stream: TcpStream) -> std::io::Result<TcpStream> {
        let [version, method_count] = read_array::<2>(&mut stream).await?;
        assert_eq!(version, Self::VERSION);
        let mut methods = vec![0u8; usize::from(method_count)];
        stream.read_exact(&mut methods).await?;

        if methods.contains(&Self::USER_PASS) {
            stream.write_all(&[Self::VERSION, Self::USER_PASS]).await?;
            // username/password subnegotiation, version 1
            let [_, user_len] = read_array::<2>(&mut stream).await?;
            let user = read_string(&mut stream, user_len).await?;
            let [pass_len] = read_array::<1>(&mut stream).await?;
            let pass = read_string(&mut stream, pass_len).await?;
            self.credentials.lock().unwrap().push((user, pass));
            stream.write_all(&[0x01, 0x00]).await?;
        } else {
            stream.write_all(&[Self::VERSION, Self::NO_AUTH]).await?;
        }

        let [_, command, _, address_type] = read_array::<4>(&mut stream).await?;
        assert_eq!(command, 0x01, "only CONNECT is supported");
        let host = match address_type {
            0x01 => std::net::Ipv4Addr::from(read_array::<4>(&mut stream).await?).to_string(),
            0x03 => {
                let [len] = read_array::<1>(&mut stream).await?;
                read_string(&mut stream, len).await?
            }
            0x04 => std::net::Ipv6Addr::from(read_array::<16>(&mut stream).await?).to_string(),
            other => panic!("unknown address type {other}"),
        };
        let port = u16::from_be_bytes(read_array::<2>(&mut stream).await?);
        self.connects.lock().unwrap().push(format!("{host}:{port}"));

        stream.write_all(&[Self::VERSION, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await?;
        Ok(stream)
    }
}

async fn read_array<const N: usize>(stream: &mut TcpStream) -> std::io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn read_string(stream: &mut TcpStream, len: u8) -> std::io::Result<String> {
    let mut buf = vec![0u8; usize::from(len)];
    stream.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub fn target(title: &str, url: &str, check: CheckConfig) -> TargetConfig {
    TargetConfig {
        title: title.to_string(),
        url: url.to_string(),
        interval: "200ms".to_string(),
        timeout: "2s".to_string(),
        proxy: None,
        check,
    }
}

pub fn config(targets: Vec<TargetConfig>) -> Config {
    Config { targets, ..Default::default() }
}

pub fn state_dir(runtime_root: &Path, title: &str) -> PathBuf {
    runtime_root.join(std::process::id().to_string()).join(title)
}

/// Poll `path` until its contents satisfy `accept`, or panic after `limit`.
pub async fn wait_for_file(path: &Path, limit: Duration, accept: impl Fn(&str) -> bool) -> String {
    let deadline = Instant::now() + limit;
    loop {
        if let Ok(contents) = fs::read_to_string(path) {
            if accept(&contents) {
                return contents;
            }
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}", path.display());
        sleep(Duration::from_millis(25)).await;
    }
}
