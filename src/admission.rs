//! Admission server (C10).
//!
//! Accept loop + per-connection handshake parsing + concurrency cap,
//! grounded on the bridge's `transport_tcp.rs::spawn_tcp_receiver`
//! accept/spawn shape. Also owns process-wide graceful shutdown: stop
//! accepting, let in-flight calls drain, then signal the caller to tear
//! down shared pools.

use std::sync::atomic::{ AtomicI64, Ordering };
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{ TcpListener, TcpStream };
use tokio::sync::Notify;
use tracing::{ debug, info, warn };

const HANDSHAKE_MAX_BYTES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeResult {
    CallId(String),
    ScanTraffic,
}

/// Peek at the first bytes of a freshly-accepted connection and classify
/// them per §4.10's five-step handshake rules.
pub async fn read_handshake(stream: &mut TcpStream) -> anyhow::Result<HandshakeResult> {
    let mut buf = vec![0u8; HANDSHAKE_MAX_BYTES];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        anyhow::bail!("connection closed before handshake");
    }
    let buf = &buf[..n];

    if looks_like_scan_traffic(buf) {
        return Ok(HandshakeResult::ScanTraffic);
    }

    if buf.len() >= 19 && buf[0] == 0x01 && buf[1] == 0x00 && buf[2] == 0x10 {
        let uuid_bytes = &buf[3..19];
        return Ok(HandshakeResult::CallId(format_uuid(uuid_bytes)));
    }

    let stripped: Vec<u8> = buf
        .iter()
        .copied()
        .filter(|&b| b != 0)
        .collect();
    let text = String::from_utf8(stripped).unwrap_or_default();
    if !text.trim().is_empty() {
        return Ok(HandshakeResult::CallId(text.trim().to_string()));
    }

    let hex_len = buf.len().min(16);
    Ok(HandshakeResult::CallId(hex::encode(&buf[..hex_len])))
}

fn looks_like_scan_traffic(buf: &[u8]) -> bool {
    if buf.len() >= 2 && buf[0] == 0x16 && buf[1] == 0x03 {
        return true; // TLS ClientHello record header.
    }
    const HTTP_VERBS: &[&[u8]] = &[b"GET ", b"POST", b"HEAD", b"PUT ", b"OPTI", b"HTTP"];
    HTTP_VERBS.iter().any(|verb| buf.starts_with(verb))
}

fn format_uuid(bytes: &[u8]) -> String {
    let hex = hex::encode(bytes);
    format!("{}-{}-{}-{}-{}", &hex[0..8], &hex[8..12], &hex[12..16], &hex[16..20], &hex[20..32])
}

mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Process-wide admission state: active-call counter and shutdown signal.
pub struct Admission {
    pub active_calls: AtomicI64,
    pub cap: i64,
    pub shutting_down: std::sync::atomic::AtomicBool,
    pub drained: Notify,
}

impl Admission {
    pub fn new(cap: i64) -> Arc<Self> {
        Arc::new(Self {
            active_calls: AtomicI64::new(0),
            cap,
            shutting_down: std::sync::atomic::AtomicBool::new(false),
            drained: Notify::new(),
        })
    }

    /// Attempt to reserve a call slot. Returns `false` if the cap is
    /// already reached or the server is draining.
    pub fn try_admit(&self) -> bool {
        if self.shutting_down.load(Ordering::Relaxed) {
            return false;
        }
        loop {
            let current = self.active_calls.load(Ordering::Relaxed);
            if current >= self.cap {
                return false;
            }
            if
                self.active_calls
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release(&self) {
        let remaining = self.active_calls.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining <= 0 && self.shutting_down.load(Ordering::Relaxed) {
            self.drained.notify_waiters();
        }
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    /// Block until every in-flight call has released its slot.
    pub async fn wait_drained(&self) {
        while self.active_calls.load(Ordering::Relaxed) > 0 {
            self.drained.notified().await;
        }
    }
}

/// Accept connections and spawn a call session for each one that is
/// admitted, handing the accepted stream and resolved call id to
/// `spawn_call`. Runs until `shutdown.notified()` resolves.
pub async fn run_accept_loop<F, Fut>(
    addr: &str,
    admission: Arc<Admission>,
    metrics: Arc<crate::metrics::Metrics>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    spawn_call: F
) -> anyhow::Result<()>
    where F: Fn(TcpStream, String) -> Fut + Send + Sync + 'static, Fut: std::future::Future<Output = ()> + Send + 'static
{
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "admission server listening");
    let spawn_call = Arc::new(spawn_call);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("admission server draining");
                    admission.begin_shutdown();
                    admission.wait_drained().await;
                    info!("admission server drained, exiting accept loop");
                    break;
                }
            }

            accepted = listener.accept() => {
                let (mut stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "admission accept error");
                        continue;
                    }
                };

                if !admission.try_admit() {
                    metrics.record_cap_rejected();
                    debug!(peer = %peer, "rejected: cap reached or draining");
                    continue;
                }

                let admission = admission.clone();
                let spawn_call = spawn_call.clone();
                tokio::spawn(async move {
                    match read_handshake(&mut stream).await {
                        Ok(HandshakeResult::CallId(call_id)) => {
                            spawn_call(stream, call_id).await;
                        }
                        Ok(HandshakeResult::ScanTraffic) => {
                            debug!(peer = %peer, "scan traffic rejected");
                        }
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "handshake failed");
                        }
                    }
                    admission.release();
                });
            }
        }
    }

    Ok(())
}
