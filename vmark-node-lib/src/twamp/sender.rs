//! TWAMP-Light sender session.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::NtpTimestamp;
use super::socket::{any_addr, udp_socket, SocketOptions};
use super::stats::{compute_result, SenderResult};
use super::wire::{encode_test, Reply};
use super::IpVersion;

/// Grace period after the send loop for one last in-flight reply.
const FINAL_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub ip_version: IpVersion,
    pub destination: SocketAddr,
    pub count: u32,
    pub interval: Duration,
    pub padding: usize,
    pub options: SocketOptions,
}

struct Collected {
    outbound: Vec<f64>,
    inbound: Vec<f64>,
    roundtrip: Vec<f64>,
}

/// Run a sender session to completion or cancellation and return its result
/// record. The record is always produced, including after socket errors, so
/// the controller always observes a termination event.
pub async fn run_sender(cfg: SenderConfig, cancel: CancellationToken) -> SenderResult {
    info!(dest = %cfg.destination, count = cfg.count, interval_ms = cfg.interval.as_millis() as u64, "TWAMP sender starting");

    let sock = match udp_socket(cfg.ip_version, any_addr(cfg.ip_version, 0), cfg.options) {
        Ok(s) => s,
        Err(err) => {
            warn!(%err, "sender socket setup failed");
            return compute_result(0, &[], &[], &[], Some(format!("socket error: {err}")));
        }
    };

    let mut sent_at: HashMap<u32, NtpTimestamp> = HashMap::new();
    let mut received: HashSet<u32> = HashSet::new();
    let mut collected = Collected { outbound: Vec::new(), inbound: Vec::new(), roundtrip: Vec::new() };
    let mut packets_tx: u32 = 0;
    let mut error: Option<String> = None;

    // Reply wait per iteration: most of the interval, never less than 1 ms.
    let reply_wait = cfg.interval.mul_f64(0.9).max(Duration::from_millis(1));
    let mut buf = [0u8; 2048];

    let mut sseq: u32 = 0;
    while sseq < cfg.count && !cancel.is_cancelled() {
        let t1 = NtpTimestamp::now();
        sent_at.insert(sseq, t1);

        let payload = encode_test(sseq, cfg.padding);
        if let Err(err) = sock.send_to(&payload, cfg.destination).await {
            warn!(sseq, %err, "send failed, aborting session");
            error = Some(format!("send error: {err}"));
            break;
        }
        packets_tx += 1;
        debug!(sseq, dest = %cfg.destination, "test packet sent");

        let received_reply = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(reply_wait, sock.recv_from(&mut buf)) => r,
        };
        match received_reply {
            Err(_) => debug!(sseq, "no reply within wait window"),
            Ok(Ok((len, _from))) => {
                process_reply(&buf[..len], &sent_at, &mut received, &mut collected);
            }
            Ok(Err(err)) => {
                if cancel.is_cancelled() {
                    break;
                }
                warn!(%err, "receive failed, aborting session");
                error = Some(format!("receive error: {err}"));
                break;
            }
        }

        // Sleep out whatever is left of the interval before the next probe.
        let elapsed = NtpTimestamp::now() - t1;
        let interval_s = cfg.interval.as_secs_f64();
        if sseq + 1 < cfg.count && elapsed < interval_s {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs_f64(interval_s - elapsed)) => {}
            }
        }
        sseq += 1;
    }

    // One bounded chance for the final reply still in flight.
    if !cancel.is_cancelled() && error.is_none() && packets_tx == cfg.count {
        let last = tokio::select! {
            _ = cancel.cancelled() => None,
            r = tokio::time::timeout(FINAL_WAIT, sock.recv_from(&mut buf)) => r.ok(),
        };
        if let Some(Ok((len, _from))) = last {
            process_reply(&buf[..len], &sent_at, &mut received, &mut collected);
        }
    }

    let result = compute_result(
        packets_tx,
        &collected.outbound,
        &collected.inbound,
        &collected.roundtrip,
        error,
    );
    info!(
        dest = %cfg.destination,
        tx = result.packets_tx,
        rx = result.packets_rx,
        loss = result.total_loss_percent,
        "TWAMP sender finished"
    );
    result
}

/// Parse one reply and credit its latencies against the recorded T1.
/// Duplicates and unknown sequence numbers are discarded; out-of-order
/// replies still land on their original send timestamp.
fn process_reply(
    data: &[u8],
    sent_at: &HashMap<u32, NtpTimestamp>,
    received: &mut HashSet<u32>,
    collected: &mut Collected,
) {
    let t4 = NtpTimestamp::now();
    let Some(reply) = Reply::decode(data) else {
        warn!(len = data.len(), "short reply packet ignored");
        return;
    };
    let Some(&t1) = sent_at.get(&reply.sseq) else {
        warn!(sseq = reply.sseq, "reply for unknown sequence number ignored");
        return;
    };
    if !received.insert(reply.sseq) {
        warn!(sseq = reply.sseq, "duplicate reply discarded");
        return;
    }

    let outbound_us = (reply.t2 - t1) * 1_000_000.0;
    let inbound_us = (t4 - reply.t3) * 1_000_000.0;
    let roundtrip_us = ((t4 - t1) - (reply.t3 - reply.t2)) * 1_000_000.0;

    collected.outbound.push(outbound_us);
    collected.inbound.push(inbound_us);
    collected.roundtrip.push(roundtrip_us);
    debug!(
        sseq = reply.sseq,
        outbound_us, inbound_us, roundtrip_us, "reply processed"
    );
}
