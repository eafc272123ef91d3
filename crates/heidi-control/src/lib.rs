//! Control surface: loopback HTTP plus filesystem latches.
//!
//! The surface is deliberately tiny. Two operations exist: `GET /status`
//! returns the current status snapshot verbatim, and
//! `POST /actions/train-now` sets the train-now latch (idempotently) for
//! the run. Everything else an operator might want goes through latch
//! files — the surface never mutates orchestrator state directly; the
//! orchestrator picks latches up at its next stage boundary.
//!
//! The listener binds to a loopback address only, and any connection that
//! somehow arrives from a non-loopback peer is rejected at accept time.
//! Surface activity that deserves a journal event is forwarded to the
//! orchestrator over a channel, because the orchestrator is the journal's
//! single writer.

pub mod latch;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;

use tiny_http::{Header, Method, Response, Server};
use tracing::{debug, warn};

/// Operations the surface forwards for journaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceSignal {
    TrainNow,
}

/// Running control endpoint for one run.
pub struct ControlServer {
    addr: SocketAddr,
    server: Arc<Server>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ControlServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlServer").field("addr", &self.addr).finish()
    }
}

impl ControlServer {
    /// Bind and serve on a worker thread. `bind` must name a loopback
    /// address (use port 0 for an ephemeral port); anything else aborts
    /// startup.
    pub fn start(
        run_root: &Path,
        run_id: &str,
        bind: &str,
        notify: Sender<SurfaceSignal>,
    ) -> std::io::Result<Self> {
        let requested: SocketAddr = bind.parse().map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("bad bind addr: {e}"))
        })?;
        if !requested.ip().is_loopback() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("control surface must bind loopback, got {}", requested.ip()),
            ));
        }

        let server = Server::http(requested).map_err(|e| {
            std::io::Error::other(format!("control bind failed: {e}"))
        })?;
        let addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| std::io::Error::other("control server has no ip addr"))?;

        let server = Arc::new(server);
        let worker = Arc::clone(&server);
        let root = run_root.to_path_buf();
        let id = run_id.to_string();
        let handle = std::thread::spawn(move || serve(&worker, &root, &id, &notify));

        Ok(Self {
            addr,
            server,
            handle: Some(handle),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting and join the worker.
    pub fn shutdown(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve(server: &Server, run_root: &Path, run_id: &str, notify: &Sender<SurfaceSignal>) {
    for request in server.incoming_requests() {
        let loopback = request
            .remote_addr()
            .map(|peer| peer.ip().is_loopback())
            .unwrap_or(false);
        if !loopback {
            warn!(peer = ?request.remote_addr(), "rejecting non-loopback control connection");
            let _ = request.respond(json_response(403, r#"{"error":"loopback only"}"#));
            continue;
        }

        let method = request.method().clone();
        let url = request.url().to_string();
        debug!(%method, %url, "control request");

        let response = route(&method, &url, run_root, run_id, notify);
        let _ = request.respond(response);
    }
}

fn route(
    method: &Method,
    url: &str,
    run_root: &Path,
    run_id: &str,
    notify: &Sender<SurfaceSignal>,
) -> Response<std::io::Cursor<Vec<u8>>> {
    match (method, url) {
        (Method::Get, "/status") => match std::fs::read_to_string(state_file(run_root)) {
            Ok(snapshot) => json_response(200, &snapshot),
            Err(_) => json_response(404, r#"{"error":"no status published"}"#),
        },
        (_, "/status") => json_response(405, r#"{"error":"method not allowed"}"#),
        (Method::Post, "/actions/train-now") => {
            match latch::request_train_now(run_root, run_id) {
                Ok(()) => {
                    // The orchestrator journals the trigger at its next
                    // boundary; a dropped receiver just means the run is
                    // already over.
                    let _ = notify.send(SurfaceSignal::TrainNow);
                    json_response(200, r#"{"status":"ok"}"#)
                }
                Err(e) => {
                    warn!(error = %e, "train-now latch failed");
                    json_response(500, r#"{"error":"latch failed"}"#)
                }
            }
        }
        (_, "/actions/train-now") => json_response(405, r#"{"error":"method not allowed"}"#),
        _ => json_response(404, r#"{"error":"not found"}"#),
    }
}

fn state_file(run_root: &Path) -> PathBuf {
    heidi_status::state_path(run_root)
}

fn json_response(status: u16, body: &str) -> Response<std::io::Cursor<Vec<u8>>> {
    let mut response = Response::from_string(body).with_status_code(status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        response = response.with_header(header);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn http(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream.write_all(request.as_bytes()).expect("send");
        let mut response = String::new();
        stream.read_to_string(&mut response).expect("recv");
        response
    }

    fn get(addr: SocketAddr, path: &str) -> String {
        http(
            addr,
            &format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"),
        )
    }

    fn post(addr: SocketAddr, path: &str) -> String {
        http(
            addr,
            &format!(
                "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            ),
        )
    }

    #[test]
    fn status_returns_snapshot_verbatim() {
        let td = tempdir().expect("tempdir");
        std::fs::write(state_file(td.path()), r#"{"run_id":"run-1","status":"IDLE"}"#)
            .expect("write state");

        let (tx, _rx) = mpsc::channel();
        let server = ControlServer::start(td.path(), "run-1", "127.0.0.1:0", tx).expect("start");

        let response = get(server.addr(), "/status");
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#"{"run_id":"run-1","status":"IDLE"}"#));
    }

    #[test]
    fn status_before_first_publish_is_404() {
        let td = tempdir().expect("tempdir");
        let (tx, _rx) = mpsc::channel();
        let server = ControlServer::start(td.path(), "run-1", "127.0.0.1:0", tx).expect("start");

        let response = get(server.addr(), "/status");
        assert!(response.starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn train_now_creates_latch_and_notifies() {
        let td = tempdir().expect("tempdir");
        let (tx, rx) = mpsc::channel();
        let server = ControlServer::start(td.path(), "run-1", "127.0.0.1:0", tx).expect("start");

        let response = post(server.addr(), "/actions/train-now");
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#"{"status":"ok"}"#));
        assert!(latch::train_now_requested(td.path(), "run-1"));
        assert_eq!(rx.recv().expect("signal"), SurfaceSignal::TrainNow);
    }

    #[test]
    fn train_now_is_idempotent() {
        let td = tempdir().expect("tempdir");
        let (tx, _rx) = mpsc::channel();
        let server = ControlServer::start(td.path(), "run-1", "127.0.0.1:0", tx).expect("start");

        assert!(post(server.addr(), "/actions/train-now").starts_with("HTTP/1.1 200"));
        assert!(post(server.addr(), "/actions/train-now").starts_with("HTTP/1.1 200"));

        let specific: Vec<_> = std::fs::read_dir(latch::actions_dir(td.path()))
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name().into_string().expect("name"))
            .filter(|n| n == "train_now.run-1")
            .collect();
        assert_eq!(specific.len(), 1);
    }

    #[test]
    fn unknown_route_is_404_and_wrong_method_is_405() {
        let td = tempdir().expect("tempdir");
        let (tx, _rx) = mpsc::channel();
        let server = ControlServer::start(td.path(), "run-1", "127.0.0.1:0", tx).expect("start");

        assert!(get(server.addr(), "/nope").starts_with("HTTP/1.1 404"));
        assert!(get(server.addr(), "/actions/train-now").starts_with("HTTP/1.1 405"));
        assert!(post(server.addr(), "/status").starts_with("HTTP/1.1 405"));
    }

    #[test]
    fn non_loopback_bind_aborts_startup() {
        let td = tempdir().expect("tempdir");
        let (tx, _rx) = mpsc::channel();
        let result = ControlServer::start(td.path(), "run-1", "0.0.0.0:0", tx);
        assert!(result.is_err());
    }

    #[test]
    fn shutdown_joins_the_worker() {
        let td = tempdir().expect("tempdir");
        let (tx, _rx) = mpsc::channel();
        let mut server =
            ControlServer::start(td.path(), "run-1", "127.0.0.1:0", tx).expect("start");
        server.shutdown();
        // A second shutdown is a no-op.
        server.shutdown();
    }
}
