//! Guarded IPC channel between the sandbox and the host.
//!
//! One UNIX stream socket per sandbox. Each line is one JSON object;
//! responses mirror the request's `type` and `id`. Connections are
//! handled concurrently, but a single connection's requests are answered
//! strictly in arrival order. An unknown request type is answered with an
//! error payload, never a transport-level failure.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// Max concurrent connections; one sandbox normally holds a single one.
const MAX_CONNECTIONS: usize = 16;

/// Maximum size of a single request line (1 MB).
const MAX_REQUEST_LINE: usize = 1024 * 1024;

/// How long `stop` waits for in-flight handlers to return.
const STOP_GRACE: Duration = Duration::from_secs(5);

// ── Protocol types ──────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub payload: Value,
}

fn error_payload(message: impl Into<String>) -> Value {
    serde_json::json!({ "error": message.into() })
}

// ── Server ──────────────────────────────────────────────────────────────

pub type Handler = Box<dyn Fn(&Request) -> Result<Value> + Send + Sync>;

/// JSON-lines request/response server on a per-sandbox UNIX socket.
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    handlers: Arc<HashMap<String, Handler>>,
    pending: HashMap<String, Handler>,
    shutdown: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl Server {
    /// Bind a fresh socket at `path` with mode 0600, replacing any stale
    /// socket file from a previous run.
    pub fn bind(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
        }
        let _ = std::fs::remove_file(path);

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind IPC socket at {}", path.display()))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        info!(path = %path.display(), "IPC socket bound");

        Ok(Self {
            socket_path: path.to_path_buf(),
            listener: Some(listener),
            handlers: Arc::new(HashMap::new()),
            pending: HashMap::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            accept_thread: None,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Register a handler for a request type. Must be called before
    /// `start`; the table is read-only afterwards.
    pub fn handle(
        &mut self,
        kind: &str,
        handler: impl Fn(&Request) -> Result<Value> + Send + Sync + 'static,
    ) {
        self.pending.insert(kind.to_string(), Box::new(handler));
    }

    /// Start the accept loop. Idempotent once: repeat calls are no-ops.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        self.handlers = Arc::new(std::mem::take(&mut self.pending));

        let handlers = Arc::clone(&self.handlers);
        let shutdown = Arc::clone(&self.shutdown);
        let in_flight = Arc::clone(&self.in_flight);
        let active = Arc::new(AtomicUsize::new(0));

        self.accept_thread = Some(thread::spawn(move || {
            for stream in listener.incoming() {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        if active.load(Ordering::Relaxed) >= MAX_CONNECTIONS {
                            warn!("IPC connection limit reached, dropping");
                            drop(stream);
                            continue;
                        }
                        active.fetch_add(1, Ordering::Relaxed);
                        let handlers = Arc::clone(&handlers);
                        let in_flight = Arc::clone(&in_flight);
                        let active = Arc::clone(&active);
                        thread::spawn(move || {
                            if let Err(e) = handle_connection(stream, &handlers, &in_flight) {
                                debug!(error = %e, "IPC connection ended");
                            }
                            active.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        debug!(error = %e, "IPC accept error, shutting down");
                        break;
                    }
                }
            }
        }));
    }

    /// Stop the server: refuse new connections, wait for in-flight
    /// handlers (bounded by a grace timeout), unlink the socket.
    pub fn stop(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        // Wake the blocking accept with a throwaway connection.
        let _ = UnixStream::connect(&self.socket_path);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }

        let deadline = Instant::now() + STOP_GRACE;
        while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            warn!("IPC handlers still in flight after grace period");
        }

        let _ = std::fs::remove_file(&self.socket_path);
        info!(path = %self.socket_path.display(), "IPC server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read one bounded line; `Ok(None)` on EOF.
fn read_bounded_line(reader: &mut impl BufRead, buf: &mut String) -> Result<Option<()>> {
    buf.clear();
    let mut bytes = Vec::new();
    let mut total = 0usize;

    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            if total == 0 {
                return Ok(None);
            }
            break;
        }

        let (take, done) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };

        total += take;
        if total > MAX_REQUEST_LINE {
            anyhow::bail!("IPC request line exceeds {} byte limit", MAX_REQUEST_LINE);
        }

        bytes.extend_from_slice(&available[..take]);
        reader.consume(take);

        if done {
            break;
        }
    }

    let s = std::str::from_utf8(&bytes).context("Invalid UTF-8 in IPC request")?;
    buf.push_str(s);
    Ok(Some(()))
}

/// Serve one connection: requests answered serially, in arrival order.
fn handle_connection(
    stream: UnixStream,
    handlers: &HashMap<String, Handler>,
    in_flight: &AtomicUsize,
) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone().context("Failed to clone IPC stream")?);
    let mut writer = stream;
    let mut line = String::new();

    while read_bounded_line(&mut reader, &mut line)?.is_some() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(trimmed) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "dropping malformed IPC request");
                continue;
            }
        };

        in_flight.fetch_add(1, Ordering::SeqCst);
        let payload = dispatch(handlers, &request);
        in_flight.fetch_sub(1, Ordering::SeqCst);

        let payload = match payload {
            Ok(payload) => payload,
            Err(()) => {
                // Handler panicked: close the connection, keep serving others.
                return Ok(());
            }
        };

        let response = Response {
            kind: request.kind,
            id: request.id,
            payload,
        };
        // Writes after teardown began are best-effort.
        let mut data = serde_json::to_vec(&response)?;
        data.push(b'\n');
        writer.write_all(&data)?;
        writer.flush()?;
    }
    Ok(())
}

fn dispatch(handlers: &HashMap<String, Handler>, request: &Request) -> Result<Value, ()> {
    let Some(handler) = handlers.get(&request.kind) else {
        return Ok(error_payload(format!("unknown type: {}", request.kind)));
    };

    match std::panic::catch_unwind(AssertUnwindSafe(|| handler(request))) {
        Ok(Ok(payload)) => Ok(payload),
        Ok(Err(e)) => Ok(error_payload(e.to_string())),
        Err(_) => {
            error!(kind = %request.kind, "IPC handler panicked");
            Err(())
        }
    }
}

// ── Approval grants ─────────────────────────────────────────────────────

/// TTL-scoped read approvals, keyed by (sandbox id, key or "*").
#[derive(Default)]
pub struct GrantStore {
    inner: Mutex<HashMap<(String, String), Instant>>,
}

impl GrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an approval for `key` (or `"*"` for all keys) lasting `ttl`.
    pub fn grant(&self, sandbox_id: &str, key: &str, ttl: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert(
            (sandbox_id.to_string(), key.to_string()),
            Instant::now() + ttl,
        );
    }

    /// True when an unexpired grant covers this key, exact or wildcard.
    /// Expired entries are purged as a side effect.
    pub fn is_granted(&self, sandbox_id: &str, key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        inner.retain(|_, expiry| *expiry > now);
        inner.contains_key(&(sandbox_id.to_string(), key.to_string()))
            || inner.contains_key(&(sandbox_id.to_string(), "*".to_string()))
    }
}

/// Host-side approval decision for one vault read. Returning a TTL both
/// approves the read and grants subsequent reads of the same key.
pub type ApprovalFn = dyn Fn(&str, &str) -> Option<Duration> + Send + Sync;

/// Mount the vault request handlers onto a server.
///
/// `vault.get` requires an active grant or a host-side approval;
/// `vault.list` and `vault.all` answer from the open store directly.
pub fn mount_vault_handlers(
    server: &mut Server,
    sandbox_id: &str,
    store: Arc<crate::vault::Store>,
    grants: Arc<GrantStore>,
    approve: Arc<ApprovalFn>,
) {
    let sandbox = sandbox_id.to_string();
    let get_store = Arc::clone(&store);
    server.handle("vault.get", move |req| {
        let key = req
            .payload
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("missing 'key' in payload"))?;

        if !grants.is_granted(&sandbox, key) {
            match approve(&sandbox, key) {
                Some(ttl) => {
                    if !ttl.is_zero() {
                        grants.grant(&sandbox, key, ttl);
                    }
                }
                None => anyhow::bail!("read of '{}' denied by host", key),
            }
        }

        let value = get_store.get(key)?;
        Ok(serde_json::json!({ "value": value }))
    });

    let list_store = Arc::clone(&store);
    server.handle("vault.list", move |_req| {
        Ok(serde_json::json!({ "keys": list_store.list()? }))
    });

    server.handle("vault.all", move |_req| {
        Ok(serde_json::json!({ "entries": store.all()? }))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_request(stream: &mut UnixStream, kind: &str, id: &str, payload: Value) -> Response {
        let request = serde_json::json!({ "type": kind, "id": id, "payload": payload });
        let mut data = serde_json::to_vec(&request).unwrap();
        data.push(b'\n');
        stream.write_all(&data).unwrap();
        stream.flush().unwrap();

        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        serde_json::from_str(&line).unwrap()
    }

    fn bound_server(dir: &Path) -> Server {
        Server::bind(&dir.join("ipc.sock")).unwrap()
    }

    #[test]
    fn echo_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = bound_server(tmp.path());
        server.handle("echo", |req| Ok(req.payload.clone()));
        server.start();

        let mut conn = UnixStream::connect(server.socket_path()).unwrap();
        let resp = send_request(
            &mut conn,
            "echo",
            "test-1",
            serde_json::json!({"msg": "hello"}),
        );

        assert_eq!(resp.kind, "echo");
        assert_eq!(resp.id, "test-1");
        assert_eq!(resp.payload["msg"], "hello");
        server.stop();
    }

    #[test]
    fn unknown_type_keeps_connection_open() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = bound_server(tmp.path());
        server.handle("known", |_| Ok(Value::Null));
        server.start();

        let mut conn = UnixStream::connect(server.socket_path()).unwrap();
        let resp = send_request(&mut conn, "nonexistent", "1", Value::Null);
        assert_eq!(resp.id, "1");
        assert_eq!(resp.kind, "nonexistent");
        assert!(
            resp.payload["error"]
                .as_str()
                .unwrap()
                .contains("unknown type: nonexistent")
        );

        // Same connection still works.
        let resp = send_request(&mut conn, "known", "2", Value::Null);
        assert_eq!(resp.id, "2");
        server.stop();
    }

    #[test]
    fn handler_errors_serialize_as_error_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = bound_server(tmp.path());
        server.handle("fail", |_| anyhow::bail!("boom"));
        server.start();

        let mut conn = UnixStream::connect(server.socket_path()).unwrap();
        let resp = send_request(&mut conn, "fail", "1", Value::Null);
        assert_eq!(resp.payload["error"], "boom");
        server.stop();
    }

    #[test]
    fn responses_preserve_arrival_order() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = bound_server(tmp.path());
        server.handle("slow", |_| {
            thread::sleep(Duration::from_millis(30));
            Ok(serde_json::json!("slow"))
        });
        server.handle("fast", |_| Ok(serde_json::json!("fast")));
        server.start();

        let mut conn = UnixStream::connect(server.socket_path()).unwrap();
        // Pipeline both requests before reading anything.
        conn.write_all(b"{\"type\":\"slow\",\"id\":\"1\"}\n{\"type\":\"fast\",\"id\":\"2\"}\n")
            .unwrap();
        conn.flush().unwrap();

        let mut reader = BufReader::new(conn);
        let mut first = String::new();
        let mut second = String::new();
        reader.read_line(&mut first).unwrap();
        reader.read_line(&mut second).unwrap();

        let first: Response = serde_json::from_str(&first).unwrap();
        let second: Response = serde_json::from_str(&second).unwrap();
        assert_eq!(first.id, "1");
        assert_eq!(second.id, "2");
        server.stop();
    }

    #[test]
    fn concurrent_connections_are_served() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = bound_server(tmp.path());
        server.handle("ping", |req| Ok(req.payload.clone()));
        server.start();

        let path = server.socket_path().to_path_buf();
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let path = path.clone();
                thread::spawn(move || {
                    let mut conn = UnixStream::connect(&path).unwrap();
                    let resp = send_request(
                        &mut conn,
                        "ping",
                        &format!("conn-{}", i),
                        serde_json::json!(i),
                    );
                    assert_eq!(resp.payload, serde_json::json!(i));
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        server.stop();
    }

    #[test]
    fn stop_unlinks_socket_and_refuses_connections() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = bound_server(tmp.path());
        server.start();
        let path = server.socket_path().to_path_buf();
        assert!(path.exists());

        server.stop();
        assert!(!path.exists());
        assert!(UnixStream::connect(&path).is_err());

        // Idempotent.
        server.stop();
    }

    #[test]
    fn handler_panic_closes_connection_only() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = bound_server(tmp.path());
        server.handle("explode", |_| panic!("handler bug"));
        server.handle("ping", |_| Ok(Value::Null));
        server.start();

        let mut conn = UnixStream::connect(server.socket_path()).unwrap();
        conn.write_all(b"{\"type\":\"explode\",\"id\":\"1\"}\n").unwrap();
        conn.flush().unwrap();
        let mut reader = BufReader::new(conn.try_clone().unwrap());
        let mut line = String::new();
        // Connection closes without a response.
        assert_eq!(reader.read_line(&mut line).unwrap(), 0);

        // Server survives and serves fresh connections.
        let mut conn = UnixStream::connect(server.socket_path()).unwrap();
        let resp = send_request(&mut conn, "ping", "2", Value::Null);
        assert_eq!(resp.id, "2");
        server.stop();
    }

    #[test]
    fn mode_is_0600() {
        let tmp = tempfile::tempdir().unwrap();
        let server = bound_server(tmp.path());
        let meta = std::fs::metadata(server.socket_path()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn grants_expire_and_wildcard_matches() {
        let grants = GrantStore::new();
        grants.grant("sb", "API_KEY", Duration::from_millis(20));
        assert!(grants.is_granted("sb", "API_KEY"));
        assert!(!grants.is_granted("sb", "OTHER"));
        assert!(!grants.is_granted("other-sb", "API_KEY"));

        thread::sleep(Duration::from_millis(40));
        assert!(!grants.is_granted("sb", "API_KEY"));

        grants.grant("sb", "*", Duration::from_secs(60));
        assert!(grants.is_granted("sb", "ANYTHING"));
    }

    #[test]
    fn vault_get_requires_grant_or_approval() {
        let env = crate::test_support::EnvGuard::isolated();
        crate::vault::init("ws", "pw").unwrap();
        let store = Arc::new(crate::vault::open("ws", "pw").unwrap());
        store.set("API_KEY", "secret").unwrap();

        let approvals = Arc::new(AtomicUsize::new(0));
        let approvals_seen = Arc::clone(&approvals);

        let tmp = tempfile::tempdir().unwrap();
        let mut server = Server::bind(&tmp.path().join("ipc.sock")).unwrap();
        let grants = Arc::new(GrantStore::new());
        mount_vault_handlers(
            &mut server,
            "sb-1",
            Arc::clone(&store),
            Arc::clone(&grants),
            Arc::new(move |_sandbox, key| {
                approvals_seen.fetch_add(1, Ordering::SeqCst);
                if key == "API_KEY" {
                    Some(Duration::from_secs(60))
                } else {
                    None
                }
            }),
        );
        server.start();

        let mut conn = UnixStream::connect(server.socket_path()).unwrap();

        // First read prompts; the returned TTL becomes a grant.
        let resp = send_request(
            &mut conn,
            "vault.get",
            "1",
            serde_json::json!({"key": "API_KEY"}),
        );
        assert_eq!(resp.payload["value"], "secret");
        assert_eq!(approvals.load(Ordering::SeqCst), 1);

        // Second read is covered by the grant, no new prompt.
        let resp = send_request(
            &mut conn,
            "vault.get",
            "2",
            serde_json::json!({"key": "API_KEY"}),
        );
        assert_eq!(resp.payload["value"], "secret");
        assert_eq!(approvals.load(Ordering::SeqCst), 1);

        // Denied key returns an error payload.
        store.set("DENIED", "x").unwrap();
        let resp = send_request(
            &mut conn,
            "vault.get",
            "3",
            serde_json::json!({"key": "DENIED"}),
        );
        assert!(resp.payload["error"].as_str().unwrap().contains("denied"));

        // list/all need no approval.
        let resp = send_request(&mut conn, "vault.list", "4", Value::Null);
        assert_eq!(
            resp.payload["keys"],
            serde_json::json!(["API_KEY", "DENIED"])
        );

        server.stop();
        drop(env);
    }
}
