use crate::error::{Error, Result};
use oauth2::url::Url;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Total time a single connection gets to deliver its request head.
const REQUEST_DEADLINE: Duration = Duration::from_secs(5);
/// Upper bound on the request line plus headers.
const MAX_REQUEST_BYTES: u64 = 16 * 1024;
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

const CONFIRMATION_PAGE: &str = "<!DOCTYPE html>\
<html><head><title>Authorization received</title><meta charset=\"UTF-8\"></head>\
<body><h1>Authorization received</h1>\
<p>You can close this window and return to the application.</p></body></html>";

/// The outcome of the authorization server redirecting back to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectResult {
    /// The user granted access, carries the authorization code.
    Code(String),
    /// The authorization server reported an error, e.g. `access_denied`.
    Error(String),
}

/// Captures a single authorization redirect on a loopback address.
///
/// The accept loop runs on its own thread and serves every connection on a
/// short-lived thread of its own, so a client that connects and stays silent
/// can't hold up the real redirect. The first `code` or `error` seen is
/// handed to [`await_result`](RedirectListener::await_result); after that the
/// accept loop exits and drops the socket.
pub struct RedirectListener {
    host: String,
    port: u16,
    path: String,
    local_addr: Option<SocketAddr>,
    shared: Option<Arc<Shared>>,
    worker: Option<JoinHandle<()>>,
    receiver: Option<Receiver<RedirectResult>>,
    captured: Option<RedirectResult>,
}

/// State shared between the accept loop and the connection threads.
struct Shared {
    path: String,
    wake: SocketAddr,
    shutdown: AtomicBool,
    captured: AtomicBool,
}

impl Shared {
    /// Stops the accept loop, connecting to it if it is parked in `accept()`.
    fn shut_down(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            let _ = TcpStream::connect_timeout(&self.wake, WAKE_TIMEOUT);
        }
    }
}

impl RedirectListener {
    /// Port `0` binds an ephemeral port; [`redirect_uri`](Self::redirect_uri)
    /// reports the real one after [`start`](Self::start).
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        RedirectListener {
            host: host.into(),
            port,
            path: "/".to_string(),
            local_addr: None,
            shared: None,
            worker: None,
            receiver: None,
            captured: None,
        }
    }

    /// Only redirects to `path` are captured, anything else gets a 404.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        self
    }

    /// Binds the socket and spawns the accept loop. Calling it while running
    /// is a no-op; calling it after [`stop`](Self::stop) binds again and
    /// forgets the previously captured result.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind((self.host.as_str(), self.port)).map_err(|source| {
            Error::Bind {
                addr: format!("{}:{}", self.host, self.port),
                source,
            }
        })?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            path: self.path.clone(),
            wake: wake_addr(local_addr),
            shutdown: AtomicBool::new(false),
            captured: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::sync_channel(1);
        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("redirect-listener".into())
                .spawn(move || accept_loop(listener, shared, tx))?
        };

        tracing::info!(addr = %local_addr, "redirect listener started");

        self.local_addr = Some(local_addr);
        self.shared = Some(shared);
        self.worker = Some(worker);
        self.receiver = Some(rx);
        self.captured = None;
        Ok(())
    }

    /// The bound address, `None` until started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// `http://{host}:{port}{path}`, using the bound port once started.
    pub fn redirect_uri(&self) -> String {
        let port = self.local_addr.map_or(self.port, |addr| addr.port());
        format!("http://{}:{}{}", self.host, port, self.path)
    }

    /// Whether the accept loop still holds the socket.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(false, |worker| !worker.is_finished())
    }

    /// Blocks until a redirect is captured or `timeout` elapses.
    ///
    /// The first captured result is cached and returned by every later call.
    /// The listener is stopped before this returns, result or not.
    pub fn await_result(&mut self, timeout: Duration) -> Result<RedirectResult> {
        if let Some(result) = &self.captured {
            return Ok(result.clone());
        }

        let receiver = self.receiver.as_ref().ok_or(Error::ListenerNotStarted)?;
        let outcome = receiver.recv_timeout(timeout);
        self.stop();

        match outcome {
            Ok(result) => {
                self.captured = Some(result.clone());
                Ok(result)
            }
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ListenerClosed),
        }
    }

    /// Releases the socket. Safe to call any number of times.
    ///
    /// Only the accept loop is joined; connection threads still reading a
    /// request give up on their own within the request deadline.
    pub fn stop(&mut self) {
        let worker = match self.worker.take() {
            Some(worker) => worker,
            None => return,
        };

        if let Some(shared) = &self.shared {
            shared.shut_down();
        }
        if worker.join().is_err() {
            tracing::warn!("redirect listener thread panicked");
        }
        tracing::debug!("redirect listener stopped");
    }
}

impl Drop for RedirectListener {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for RedirectListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectListener")
            .field("redirect_uri", &self.redirect_uri())
            .field("running", &self.is_running())
            .field("captured", &self.captured.is_some())
            .finish()
    }
}

fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>, tx: SyncSender<RedirectResult>) {
    for stream in listener.incoming() {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("failed to accept redirect connection: {}", e);
                continue;
            }
        };

        let shared = Arc::clone(&shared);
        let tx = tx.clone();
        let spawned = std::thread::Builder::new()
            .name("redirect-connection".into())
            .spawn(move || serve(stream, &shared, &tx));
        if let Err(e) = spawned {
            tracing::warn!("failed to spawn redirect connection thread: {}", e);
        }
    }
    tracing::debug!("redirect accept loop finished");
}

fn serve(mut stream: TcpStream, shared: &Shared, tx: &SyncSender<RedirectResult>) {
    let deadline = Instant::now() + REQUEST_DEADLINE;
    let outcome = match read_request(&stream, deadline) {
        Ok(Some(request_line)) => classify(&request_line, &shared.path),
        Ok(None) => Outcome::Rejected(
            "431 Request Header Fields Too Large",
            "Error: request too large",
        ),
        Err(e) => {
            tracing::debug!("failed to read redirect request: {}", e);
            return;
        }
    };

    match outcome {
        Outcome::Captured(result) => {
            if shared.captured.swap(true, Ordering::SeqCst) {
                let _ = respond(&mut stream, "409 Conflict", "Error: redirect already received");
                return;
            }
            // only the first capture reaches the one-slot channel
            let _ = tx.try_send(result);
            let _ = respond(&mut stream, "200 OK", CONFIRMATION_PAGE);
            shared.shut_down();
        }
        Outcome::Rejected(status, body) => {
            let _ = respond(&mut stream, status, body);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Captured(RedirectResult),
    Rejected(&'static str, &'static str),
}

/// Reads every read against one overall deadline, so a client trickling
/// bytes can't keep the connection alive.
struct DeadlineReader<'a> {
    stream: &'a TcpStream,
    deadline: Instant,
}

impl Read for DeadlineReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self
            .deadline
            .checked_duration_since(Instant::now())
            .filter(|remaining| !remaining.is_zero())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "request deadline elapsed")
            })?;
        self.stream.set_read_timeout(Some(remaining))?;
        self.stream.read(buf)
    }
}

/// Returns the request line, or `None` if the request head doesn't fit in
/// `MAX_REQUEST_BYTES`. Headers are drained so closing the socket doesn't
/// reset the connection.
fn read_request(stream: &TcpStream, deadline: Instant) -> std::io::Result<Option<String>> {
    let reader = DeadlineReader { stream, deadline }.take(MAX_REQUEST_BYTES);
    let mut reader = BufReader::new(reader);

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    if !request_line.ends_with('\n') {
        return Ok(None);
    }

    let mut header = String::new();
    loop {
        header.clear();
        let read = reader.read_line(&mut header)?;
        if read > 0 && !header.ends_with('\n') {
            return Ok(None);
        }
        if read == 0 || header.trim().is_empty() {
            break;
        }
    }

    Ok(Some(request_line))
}

fn classify(request_line: &str, path: &str) -> Outcome {
    let mut parts = request_line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next()) {
        (Some(method), Some(target)) => (method, target),
        _ => return Outcome::Rejected("400 Bad Request", "Error: malformed request"),
    };
    if method != "GET" {
        return Outcome::Rejected("405 Method Not Allowed", "Error: only GET is supported");
    }

    let url = match Url::parse("http://localhost").and_then(|base| base.join(target)) {
        Ok(url) => url,
        Err(_) => return Outcome::Rejected("400 Bad Request", "Error: malformed request"),
    };
    if url.path() != path {
        return Outcome::Rejected("404 Not Found", "Error: not found");
    }

    match parse_redirect(&url) {
        Some(result) => Outcome::Captured(result),
        None => Outcome::Rejected(
            "400 Bad Request",
            "Error: no code or error found in query params",
        ),
    }
}

/// `code` wins over `error`; neither means the request isn't a redirect.
pub(crate) fn parse_redirect(url: &Url) -> Option<RedirectResult> {
    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => return Some(RedirectResult::Code(value.into_owned())),
            "error" if error.is_none() => error = Some(value.into_owned()),
            "error_description" => {
                tracing::debug!(description = %value, "authorization server reported an error")
            }
            _ => {}
        }
    }
    error.map(RedirectResult::Error)
}

fn respond(stream: &mut TcpStream, status: &str, body: &str) -> std::io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )?;
    stream.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(addr: SocketAddr, target: &str) -> std::io::Result<String> {
        let mut stream = TcpStream::connect(addr)?;
        write!(
            stream,
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            target
        )?;
        let mut response = String::new();
        stream.read_to_string(&mut response)?;
        Ok(response)
    }

    fn started() -> RedirectListener {
        let mut listener = RedirectListener::new("127.0.0.1", 0);
        listener.start().unwrap();
        listener
    }

    #[test]
    fn redirect_uri_before_and_after_start() {
        let mut listener = RedirectListener::new("127.0.0.1", 0).with_path("callback");
        assert_eq!(listener.redirect_uri(), "http://127.0.0.1:0/callback");

        listener.start().unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_ne!(port, 0);
        assert_eq!(
            listener.redirect_uri(),
            format!("http://127.0.0.1:{}/callback", port)
        );
    }

    #[test]
    fn captures_code_once() {
        let mut listener = started();
        let addr = listener.local_addr().unwrap();

        let response = get(addr, "/?code=ABC123").unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("Authorization received"));

        let result = listener.await_result(Duration::from_secs(5)).unwrap();
        assert_eq!(result, RedirectResult::Code("ABC123".into()));

        // the socket is gone, a late redirect can't reach us
        let _ = get(addr, "/?code=OTHER");
        let result = listener.await_result(Duration::from_secs(0)).unwrap();
        assert_eq!(result, RedirectResult::Code("ABC123".into()));
    }

    #[test]
    fn captures_error() {
        let mut listener = started();
        let addr = listener.local_addr().unwrap();

        get(addr, "/?error=access_denied&error_description=nope").unwrap();
        let result = listener.await_result(Duration::from_secs(5)).unwrap();
        assert_eq!(result, RedirectResult::Error("access_denied".into()));
    }

    #[test]
    fn keeps_listening_after_bad_requests() {
        let mut listener = started();
        let addr = listener.local_addr().unwrap();

        let response = get(addr, "/?state=xyz").unwrap();
        assert!(response.starts_with("HTTP/1.1 400"));
        let response = get(addr, "/favicon.ico").unwrap();
        assert!(response.starts_with("HTTP/1.1 404"));

        get(addr, "/?code=later").unwrap();
        let result = listener.await_result(Duration::from_secs(5)).unwrap();
        assert_eq!(result, RedirectResult::Code("later".into()));
    }

    #[test]
    fn timeout_releases_socket() {
        let mut listener = started();
        let addr = listener.local_addr().unwrap();

        let err = listener.await_result(Duration::from_secs(0)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(!listener.is_running());
        TcpListener::bind(addr).unwrap();
    }

    #[test]
    fn stop_is_idempotent() {
        let mut listener = RedirectListener::new("127.0.0.1", 0);
        listener.stop();

        listener.start().unwrap();
        let addr = listener.local_addr().unwrap();
        listener.stop();
        listener.stop();
        TcpListener::bind(addr).unwrap();
    }

    #[test]
    fn idle_connection_does_not_block_redirect() {
        let mut listener = started();
        let addr = listener.local_addr().unwrap();

        let _idle = TcpStream::connect(addr).unwrap();
        let started_at = Instant::now();
        get(addr, "/?code=ABC").unwrap();
        let result = listener.await_result(Duration::from_secs(3)).unwrap();

        assert_eq!(result, RedirectResult::Code("ABC".into()));
        assert!(started_at.elapsed() < REQUEST_DEADLINE);
    }

    #[test]
    fn idle_connection_does_not_delay_timeout() {
        let mut listener = started();
        let addr = listener.local_addr().unwrap();

        let _idle = TcpStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let started_at = Instant::now();
        let err = listener.await_result(Duration::from_millis(0)).unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert!(started_at.elapsed() < Duration::from_secs(2));
        TcpListener::bind(addr).unwrap();
    }

    #[test]
    fn oversized_request_is_rejected() {
        let mut listener = started();
        let addr = listener.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        let line = vec![b'a'; MAX_REQUEST_BYTES as usize];
        stream.write_all(b"GET /?code=").unwrap();
        stream.write_all(&line).unwrap();
        let mut response = String::new();
        // the server may reset the connection over the unread tail
        let _ = stream.read_to_string(&mut response);
        if !response.is_empty() {
            assert!(response.starts_with("HTTP/1.1 431"));
        }

        get(addr, "/?code=after").unwrap();
        let result = listener.await_result(Duration::from_secs(5)).unwrap();
        assert_eq!(result, RedirectResult::Code("after".into()));
    }

    #[test]
    fn trickling_client_hits_deadline() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        let (accepted, _) = server.accept().unwrap();

        let writer = std::thread::spawn(move || {
            for _ in 0..40 {
                if client.write_all(b"G").is_err() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        });

        let started_at = Instant::now();
        let err = read_request(&accepted, Instant::now() + Duration::from_millis(300)).unwrap_err();
        assert!(matches!(
            err.kind(),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
        ));
        assert!(started_at.elapsed() < Duration::from_secs(1));

        drop(accepted);
        writer.join().unwrap();
    }

    #[test]
    fn stop_does_not_wait_for_trickling_client() {
        let mut listener = started();
        let addr = listener.local_addr().unwrap();

        let mut slow = TcpStream::connect(addr).unwrap();
        slow.write_all(b"GET /?co").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let started_at = Instant::now();
        listener.stop();
        assert!(started_at.elapsed() < Duration::from_secs(2));
        TcpListener::bind(addr).unwrap();
    }

    #[test]
    fn restarts_after_stop() {
        let mut listener = started();
        listener.stop();

        listener.start().unwrap();
        assert!(listener.is_running());
        let addr = listener.local_addr().unwrap();

        get(addr, "/?code=second").unwrap();
        let result = listener.await_result(Duration::from_secs(5)).unwrap();
        assert_eq!(result, RedirectResult::Code("second".into()));
    }

    #[test]
    fn await_before_start_fails() {
        let mut listener = RedirectListener::new("127.0.0.1", 0);
        let err = listener.await_result(Duration::from_secs(0)).unwrap_err();
        assert!(matches!(err, Error::ListenerNotStarted));
    }

    #[test]
    fn bind_error_when_port_taken() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut listener = RedirectListener::new("127.0.0.1", port);
        let err = listener.start().unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
    }

    #[test]
    fn code_takes_precedence_over_error() {
        let url = Url::parse("http://localhost/?error=x&code=abc").unwrap();
        assert_eq!(
            parse_redirect(&url),
            Some(RedirectResult::Code("abc".into()))
        );

        let url = Url::parse("http://localhost/?state=1").unwrap();
        assert_eq!(parse_redirect(&url), None);
    }

    #[test]
    fn classify_rejects_other_methods() {
        assert_eq!(
            classify("POST /?code=x HTTP/1.1\r\n", "/"),
            Outcome::Rejected("405 Method Not Allowed", "Error: only GET is supported")
        );
        assert_eq!(
            classify("GET /?code=a%2Fb HTTP/1.1\r\n", "/"),
            Outcome::Captured(RedirectResult::Code("a/b".into()))
        );
    }
}
