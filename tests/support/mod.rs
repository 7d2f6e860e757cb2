//! A minimal loopback HTTP server for scenario tests. No mock-HTTP crate
//! exists anywhere in the corpus this crate was grounded on, so scenarios
//! that need to observe real POSTs talk to this hand-rolled server instead.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct CapturedRequest {
    pub request_line: String,
    pub headers: Vec<String>,
    pub body: String,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        let prefix = format!("{name}:");
        self.headers
            .iter()
            .find(|h| h.to_lowercase().starts_with(&prefix.to_lowercase()))
            .map(|h| h.splitn(2, ':').nth(1).unwrap_or("").trim())
    }
}

pub struct MockServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    statuses: Arc<Mutex<Vec<u16>>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MockServer {
    /// Start a server that responds to each request with the next status
    /// in `statuses`, repeating the last one once the list is exhausted.
    pub fn start(statuses: Vec<u16>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
        listener.set_nonblocking(true).expect("set nonblocking");
        let addr = listener.local_addr().expect("local addr");

        let requests = Arc::new(Mutex::new(Vec::new()));
        let statuses = Arc::new(Mutex::new(statuses));
        let shutdown = Arc::new(AtomicBool::new(false));

        let req_handle = Arc::clone(&requests);
        let status_handle = Arc::clone(&statuses);
        let shutdown_handle = Arc::clone(&shutdown);

        let handle = thread::spawn(move || loop {
            if shutdown_handle.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept() {
                Ok((stream, _)) => {
                    let _ = handle_connection(stream, &req_handle, &status_handle);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(_) => break,
            }
        });

        Self { addr, requests, statuses, shutdown, handle: Some(handle) }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().iter().map(|r| r.request_line.clone()).collect()
    }

    pub fn last_request(&self) -> Option<CapturedRequest> {
        self.requests.lock().unwrap().pop()
    }

    #[allow(dead_code)]
    pub fn set_statuses(&self, statuses: Vec<u16>) {
        *self.statuses.lock().unwrap() = statuses;
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_connection(
    stream: TcpStream,
    requests: &Arc<Mutex<Vec<CapturedRequest>>>,
    statuses: &Arc<Mutex<Vec<u16>>>,
) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut stream = stream;

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    let mut headers = Vec::new();
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let trimmed = line.trim_end().to_string();
        if trimmed.is_empty() {
            break;
        }
        if let Some(value) = trimmed.to_lowercase().strip_prefix("content-length:") {
            content_length = value.trim().parse().unwrap_or(0);
        }
        headers.push(trimmed);
    }

    let mut body_bytes = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body_bytes)?;
    }
    let body = String::from_utf8_lossy(&body_bytes).to_string();

    let status = {
        let mut statuses = statuses.lock().unwrap();
        if statuses.len() > 1 {
            statuses.remove(0)
        } else {
            statuses.last().copied().unwrap_or(200)
        }
    };

    requests.lock().unwrap().push(CapturedRequest { request_line: request_line.trim_end().to_string(), headers, body });

    let reason = reason_phrase(status);
    let response_body = "{}";
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{response_body}",
        len = response_body.len()
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        401 => "Unauthorized",
        500 => "Internal Server Error",
        _ => "Status",
    }
}
