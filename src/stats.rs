// stats.rs - per-connection link statistics and piggyback policy
// Numan Thabit 2025

use tracing::trace;

use crate::{
    clock::{Timestamp, MILLION},
    proto::{
        CMsgSteamDatagramLinkInstantaneousStats, CMsgSteamDatagramLinkLifetimeStats,
        CMsgSteamDatagramLinkStats,
    },
};

/// Bits carried in `CMsgSteamSockets_UDP_Stats.flags`.
pub mod flags {
    /// Peer should acknowledge end-to-end.
    pub const ACK_REQUEST_E2E: u32 = 2;
    /// The acknowledgement should not be delayed.
    pub const ACK_REQUEST_IMMEDIATE: u32 = 4;
}

/// Idle interval after which we solicit a keepalive ack.
pub const KEEPALIVE_INTERVAL: Timestamp = 10 * MILLION;

/// Cadence at which a full stats block must go out while traffic flows.
pub const STATS_INTERVAL: Timestamp = 5 * MILLION;

/// After this long a stats block is worth sending opportunistically.
const STATS_OPPORTUNISTIC_INTERVAL: Timestamp = 2 * MILLION;

/// How long a delayed ack may sit before it must be flushed.
pub const ACK_DELAY: Timestamp = 100_000;

/// Handshake ping samples older than this are garbage.
pub const PING_SANITY_MAX: Timestamp = 2 * MILLION;

/// What kind of reply the caller wants the next outbound packet to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsReplyRequest {
    NothingToSend,
    DelayedOk,
    Immediate,
}

/// Exponentially smoothed ping estimate.
#[derive(Debug, Default)]
pub struct PingTracker {
    smoothed_ms: Option<u32>,
    samples: u64,
}

impl PingTracker {
    pub fn received_ping(&mut self, ping_ms: u32) {
        self.samples += 1;
        self.smoothed_ms = Some(match self.smoothed_ms {
            None => ping_ms,
            Some(prev) => (prev * 7 + ping_ms) / 8,
        });
    }

    pub fn smoothed_ms(&self) -> Option<u32> {
        self.smoothed_ms
    }
}

/// Per-connection counters, deadlines, and piggyback decisions.
///
/// The connection feeds every send/receive through here; in return this
/// decides when acks, keepalives, and stats blocks need to ride along, and
/// when the connection has to wake up next.
#[derive(Debug)]
pub struct EndpointStats {
    created: Timestamp,

    next_packet_number: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_recv: u64,
    pub bytes_recv: u64,
    pub recv_sequenced: u64,
    pub recv_dropped: u64,
    pub recv_out_of_order: u64,
    pub recv_duplicate: u64,

    pub ping: PingTracker,
    pub peer_protocol_version: u32,

    last_send: Timestamp,
    last_recv: Timestamp,

    // When we owe the peer an end-to-end ack, and whether it must be prompt.
    ack_due: Timestamp,
    ack_immediate: bool,

    last_stats_sent: Timestamp,
    // Set while we have an unanswered ack request out.
    reply_pending_since: Timestamp,

    // Rate window for the instantaneous block.
    rate_mark: Timestamp,
    rate_sent_mark: u64,
    rate_recv_mark: u64,
    rate_sent_bytes_mark: u64,
    rate_recv_bytes_mark: u64,
}

impl EndpointStats {
    pub fn new(now: Timestamp) -> Self {
        Self {
            created: now,
            next_packet_number: 1,
            packets_sent: 0,
            bytes_sent: 0,
            packets_recv: 0,
            bytes_recv: 0,
            recv_sequenced: 0,
            recv_dropped: 0,
            recv_out_of_order: 0,
            recv_duplicate: 0,
            ping: PingTracker::default(),
            peer_protocol_version: 0,
            last_send: 0,
            last_recv: 0,
            ack_due: 0,
            ack_immediate: false,
            last_stats_sent: 0,
            reply_pending_since: 0,
            rate_mark: now,
            rate_sent_mark: 0,
            rate_recv_mark: 0,
            rate_sent_bytes_mark: 0,
            rate_recv_bytes_mark: 0,
        }
    }

    /// Allocates the next outbound packet number and returns its wire form.
    pub fn consume_packet_number(&mut self) -> (u64, u16) {
        let full = self.next_packet_number;
        self.next_packet_number += 1;
        (full, full as u16)
    }

    pub fn track_sent_packet(&mut self, len: usize, now: Timestamp) {
        self.packets_sent += 1;
        self.bytes_sent += len as u64;
        self.last_send = now;
    }

    pub fn track_recv_packet(&mut self, len: usize, now: Timestamp) {
        self.packets_recv += 1;
        self.bytes_recv += len as u64;
        self.last_recv = now;
        // Any inbound traffic answers an outstanding ack request.
        self.reply_pending_since = 0;
    }

    /// Records delivery of a sequenced (data) packet, counting the gap to
    /// the previous high watermark as drops.
    pub fn track_recv_sequenced(&mut self, full_seq: u64, prev_high: u64) {
        self.recv_sequenced += 1;
        if full_seq > prev_high + 1 {
            self.recv_dropped += full_seq - prev_high - 1;
        } else if full_seq <= prev_high {
            self.recv_out_of_order += 1;
        }
    }

    pub fn track_recv_duplicate(&mut self) {
        self.recv_duplicate += 1;
    }

    /// Refreshes the inbound-progress clock without counting a packet.
    pub fn note_recv_activity(&mut self, now: Timestamp) {
        self.last_recv = now;
    }

    /// Anchor for the no-progress timeout.
    pub fn last_recv_or_created(&self) -> Timestamp {
        self.last_recv.max(self.created)
    }

    /// Notes that the peer asked for an end-to-end ack.
    pub fn queue_ack(&mut self, immediate: bool, now: Timestamp) {
        let due = if immediate { now } else { now + ACK_DELAY };
        if self.ack_due == 0 || due < self.ack_due {
            self.ack_due = due;
        }
        self.ack_immediate = self.ack_immediate || immediate;
    }

    pub fn ack_pending(&self) -> bool {
        self.ack_due != 0
    }

    fn ack_overdue(&self, now: Timestamp) -> bool {
        self.ack_due != 0 && now >= self.ack_due
    }

    fn last_activity(&self) -> Timestamp {
        self.last_send.max(self.last_recv).max(self.created)
    }

    fn need_keepalive(&self, now: Timestamp) -> bool {
        now.saturating_sub(self.last_activity()) >= KEEPALIVE_INTERVAL
    }

    fn had_traffic(&self) -> bool {
        self.packets_sent + self.packets_recv > 0
    }

    /// A full stats block must go on the next packet.
    pub fn need_to_send_stats(&self, now: Timestamp) -> bool {
        self.had_traffic()
            && now.saturating_sub(self.last_stats_sent.max(self.created)) >= STATS_INTERVAL
    }

    /// A stats block is worth sending if the packet has room to spare.
    pub fn ready_to_send_stats(&self, now: Timestamp) -> bool {
        self.had_traffic()
            && now.saturating_sub(self.last_stats_sent.max(self.created))
                >= STATS_OPPORTUNISTIC_INTERVAL
    }

    /// Reason we must emit a standalone stats packet right now, if any.
    pub fn whats_needed_now(&self, now: Timestamp) -> Option<&'static str> {
        if self.ack_overdue(now) {
            Some("ack")
        } else if self.need_keepalive(now) {
            Some("keepalive")
        } else if self.need_to_send_stats(now) {
            Some("stats")
        } else {
            None
        }
    }

    /// Ack-request flags for the next outbound packet (§ the piggyback
    /// rules): E2E when an ack is wanted, plus IMMEDIATE when it must be
    /// prompt.
    pub fn compute_flags(&self, reply: StatsReplyRequest, now: Timestamp) -> u32 {
        if reply == StatsReplyRequest::Immediate {
            return flags::ACK_REQUEST_E2E | flags::ACK_REQUEST_IMMEDIATE;
        }
        if reply == StatsReplyRequest::DelayedOk || self.need_keepalive(now) {
            return flags::ACK_REQUEST_E2E;
        }
        0
    }

    /// Whether the connection has gone too long without inbound progress.
    pub fn timed_out(&self, now: Timestamp, timeout: Timestamp) -> bool {
        now.saturating_sub(self.last_recv.max(self.created)) >= timeout
    }

    /// Earliest time this collaborator needs the connection to think again.
    pub fn next_think_time(&self, now: Timestamp, timeout: Timestamp) -> Timestamp {
        let mut next = self.last_recv.max(self.created) + timeout;
        if self.ack_due != 0 {
            next = next.min(self.ack_due);
        }
        if self.had_traffic() {
            next = next.min(self.last_stats_sent.max(self.created) + STATS_INTERVAL);
        }
        next = next.min(self.last_activity() + KEEPALIVE_INTERVAL);
        next.max(now)
    }

    /// Fills the on-wire stats block.
    pub fn populate_message(&mut self, now: Timestamp) -> CMsgSteamDatagramLinkStats {
        let lifetime = CMsgSteamDatagramLinkLifetimeStats {
            packets_sent: Some(self.packets_sent),
            kb_sent: Some(self.bytes_sent / 1024),
            packets_recv: Some(self.packets_recv),
            kb_recv: Some(self.bytes_recv / 1024),
            packets_recv_sequenced: Some(self.recv_sequenced),
            packets_recv_dropped: Some(self.recv_dropped),
            packets_recv_out_of_order: Some(self.recv_out_of_order),
            packets_recv_duplicate: Some(self.recv_duplicate),
            packets_recv_lurch: None,
        };

        let elapsed = now.saturating_sub(self.rate_mark).max(1);
        let pps = |count: u64| ((count * 10 * MILLION) / elapsed) as u32;
        let bps = |count: u64| ((count * MILLION) / elapsed) as u32;
        let instantaneous = CMsgSteamDatagramLinkInstantaneousStats {
            out_packets_per_sec_x10: Some(pps(self.packets_sent - self.rate_sent_mark)),
            out_bytes_per_sec: Some(bps(self.bytes_sent - self.rate_sent_bytes_mark)),
            in_packets_per_sec_x10: Some(pps(self.packets_recv - self.rate_recv_mark)),
            in_bytes_per_sec: Some(bps(self.bytes_recv - self.rate_recv_bytes_mark)),
            ping_ms: self.ping.smoothed_ms(),
            packets_dropped_pct: None,
            packets_weird_sequence_pct: None,
        };
        self.rate_mark = now;
        self.rate_sent_mark = self.packets_sent;
        self.rate_recv_mark = self.packets_recv;
        self.rate_sent_bytes_mark = self.bytes_sent;
        self.rate_recv_bytes_mark = self.bytes_recv;

        CMsgSteamDatagramLinkStats {
            lifetime: Some(lifetime),
            instantaneous: Some(instantaneous),
        }
    }

    /// Applies a stats block received from the peer.
    pub fn process_message(&mut self, msg: &CMsgSteamDatagramLinkStats, _now: Timestamp) {
        if let Some(inst) = &msg.instantaneous {
            trace!(
                peer_ping_ms = inst.ping_ms,
                in_pps_x10 = inst.in_packets_per_sec_x10,
                "peer instantaneous stats"
            );
        }
        if let Some(life) = &msg.lifetime {
            trace!(
                peer_packets_sent = life.packets_sent,
                peer_packets_recv = life.packets_recv,
                "peer lifetime stats"
            );
        }
    }

    /// Bookkeeping after a stats message went on the wire.
    pub fn track_sent_stats(&mut self, had_stats_block: bool, sent_flags: u32, now: Timestamp) {
        if had_stats_block {
            self.last_stats_sent = now;
        }
        if had_stats_block || sent_flags & flags::ACK_REQUEST_E2E != 0 {
            if self.reply_pending_since == 0 {
                self.reply_pending_since = now;
            }
        }
        // Anything we send with stats on it discharges the ack we owed.
        self.ack_due = 0;
        self.ack_immediate = false;
    }
}
