//! TWAMP-Light reflector session.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::NtpTimestamp;
use super::socket::{any_addr, udp_socket, SocketOptions};
use super::wire::{decode_test_seq, Reply};
use super::IpVersion;
use crate::error::Result;

/// How long a blocked receive may delay cancellation.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    pub ip_version: IpVersion,
    /// Local address to bind; wildcard for the family when `None`.
    pub bind_addr: Option<IpAddr>,
    pub port: u16,
    /// Per-source session reset timer in seconds; 0 disables resets.
    pub reset_timer_secs: u64,
    pub options: SocketOptions,
}

/// A bound reflector, ready to run. Binding is separated from running so the
/// caller sees bind errors synchronously and can learn the local address.
pub struct Reflector {
    sock: UdpSocket,
    cfg: ReflectorConfig,
}

impl Reflector {
    pub fn bind(cfg: ReflectorConfig) -> Result<Self> {
        let bind = match cfg.bind_addr {
            Some(ip) => SocketAddr::new(ip, cfg.port),
            None => any_addr(cfg.ip_version, cfg.port),
        };
        let sock = udp_socket(cfg.ip_version, bind, cfg.options)?;
        Ok(Self { sock, cfg })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    /// Serve test packets until cancelled. Keeps one reflector sequence
    /// number and one last-seen time per source; when the reset timer is
    /// armed, a source silent for longer than the timer restarts at rseq 0.
    pub async fn run(self, cancel: CancellationToken) {
        let addr = self.sock.local_addr().ok();
        info!(?addr, version = %self.cfg.ip_version, "TWAMP reflector listening");

        let mut rseq_by_source: HashMap<SocketAddr, u32> = HashMap::new();
        let mut last_seen: HashMap<SocketAddr, f64> = HashMap::new();
        let mut buf = [0u8; 2048];

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = tokio::time::timeout(POLL_TIMEOUT, self.sock.recv_from(&mut buf)) => r,
            };
            let (len, source) = match received {
                Err(_) => continue, // poll timeout, re-check cancellation
                Ok(Ok(pair)) => pair,
                Ok(Err(err)) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!(%err, "reflector receive error");
                    continue;
                }
            };

            let t2 = NtpTimestamp::now();
            let Some(sseq) = decode_test_seq(&buf[..len]) else {
                warn!(%source, len, "short test packet ignored");
                continue;
            };

            let now = t2.to_unix_f64();
            if self.cfg.reset_timer_secs > 0 {
                if let Some(seen) = last_seen.get(&source) {
                    if now - seen > self.cfg.reset_timer_secs as f64 {
                        info!(%source, "session reset timer expired, restarting sequence");
                        rseq_by_source.insert(source, 0);
                    }
                }
                last_seen.insert(source, now);
            }

            let rseq = rseq_by_source.entry(source).or_insert_with(|| {
                debug!(%source, "new reflector session");
                0
            });

            let reply = Reply { rseq: *rseq, t2, t3: NtpTimestamp::now(), sseq };
            match self.sock.send_to(&reply.encode(), source).await {
                Ok(_) => {
                    debug!(%source, rseq = *rseq, sseq, "reply sent");
                    *rseq += 1;
                }
                Err(err) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!(%source, %err, "reflector send error");
                }
            }
        }

        info!(?addr, "TWAMP reflector stopped");
    }
}
