//! Link adapter - sequencing, priority queuing and acknowledgment tracking
//!
//! The adapter owns one simulated connection. The frame path calls `send`
//! synchronously; a monitor task calls `tick` on a fixed interval to move
//! queued packets onto the channel, collect deliveries and recompute the
//! link status. All mutable state sits behind one lock, held only for the
//! length of a mutation. Status goes out through a `watch` channel so
//! readers never touch that lock.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use skylink_core::{SkylinkError, SkylinkResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{link_quality, ChannelConfig, LinkSnapshot, LinkStatus, SimulatedChannel};

/// Link adapter tuning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Monitor tick period
    pub monitor_interval_ms: u64,
    /// Age at which a pending send counts toward the loss rate
    pub ack_timeout_ms: u64,
    /// Age at which a pending send is dropped and counted lost
    pub eviction_ms: u64,
    /// Retransmissions allowed for priority-0 packets
    pub max_retries: u32,
    pub latency_history: usize,
    pub receive_buffer: usize,
    pub max_queue: usize,
    pub max_payload_bytes: usize,
    pub bandwidth_floor_bps: f64,
    pub bandwidth_ceiling_bps: f64,
    /// Lookback for the bandwidth estimate
    pub bandwidth_window_ms: u64,
    /// Consecutive floor ticks before the link reports saturation
    pub saturation_ticks: u32,
    pub stale_after_ms: u64,
    /// `receive` polling period
    pub receive_poll_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            monitor_interval_ms: 100,
            ack_timeout_ms: 1000,
            eviction_ms: 3000,
            max_retries: 1,
            latency_history: 50,
            receive_buffer: 300,
            max_queue: 256,
            max_payload_bytes: 512,
            bandwidth_floor_bps: 2000.0,
            bandwidth_ceiling_bps: 4000.0,
            bandwidth_window_ms: 1000,
            saturation_ticks: 30,
            stale_after_ms: 3000,
            receive_poll_ms: 10,
        }
    }
}

impl LinkConfig {
    #[inline]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    #[inline]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    #[inline]
    pub fn eviction(&self) -> Duration {
        Duration::from_millis(self.eviction_ms)
    }

    #[inline]
    pub fn bandwidth_window(&self) -> Duration {
        Duration::from_millis(self.bandwidth_window_ms)
    }

    #[inline]
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    #[inline]
    pub fn receive_poll(&self) -> Duration {
        Duration::from_millis(self.receive_poll_ms.max(1))
    }

    pub fn validate(&self) -> SkylinkResult<()> {
        let fail = |msg: &str| Err(SkylinkError::InvalidConfig(msg.to_string()));
        if self.monitor_interval_ms == 0 {
            return fail("monitor interval is zero");
        }
        if self.ack_timeout_ms == 0 || self.eviction_ms < self.ack_timeout_ms {
            return fail("eviction must not come before the ack timeout");
        }
        if self.latency_history == 0 || self.receive_buffer == 0 || self.max_queue == 0 {
            return fail("link buffers must hold at least one entry");
        }
        if self.max_payload_bytes == 0 {
            return fail("max payload is zero");
        }
        if !(self.bandwidth_floor_bps > 0.0 && self.bandwidth_floor_bps <= self.bandwidth_ceiling_bps)
        {
            return fail("bandwidth floor must be positive and not above the ceiling");
        }
        if self.bandwidth_window_ms == 0 {
            return fail("bandwidth window is zero");
        }
        Ok(())
    }
}

/// One unacknowledged send
#[derive(Clone, Debug)]
pub struct PendingPacket {
    pub sequence: u64,
    pub payload: Bytes,
    pub priority: u8,
    /// Refreshed on retransmission
    pub send_timestamp: Instant,
    /// Last hand-off to the channel
    pub transmitted_at: Option<Instant>,
    pub retry_count: u32,
    /// Handed to the channel since the last (re)queue
    on_air: bool,
}

impl PendingPacket {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.send_timestamp)
    }

    /// Time since the last transmission, if it has left the queue
    fn airtime(&self, now: Instant) -> Option<Duration> {
        self.transmitted_at
            .filter(|_| self.on_air)
            .map(|at| now.saturating_duration_since(at))
    }
}

struct LinkState {
    next_sequence: u64,
    /// Min-heap on (priority, sequence)
    queue: BinaryHeap<Reverse<(u8, u64)>>,
    pending: BTreeMap<u64, PendingPacket>,
    receive_buffer: VecDeque<Bytes>,
    latency_history: VecDeque<f64>,
    /// (ack time, bytes)
    acked: VecDeque<(Instant, usize)>,
    /// Newest priority-0 sequence the far end has received
    last_acked_keyframe: Option<u64>,
    channel: SimulatedChannel,
    /// Bytes the channel may still accept
    credit: f64,
    last_tick: Option<Instant>,
    floor_ticks: u32,
    status: LinkStatus,
    closed: bool,
}

struct LinkShared {
    config: LinkConfig,
    state: Mutex<LinkState>,
    snapshot: watch::Sender<LinkSnapshot>,
}

/// Simulated constrained link, cheap to clone
#[derive(Clone)]
pub struct LinkAdapter {
    shared: Arc<LinkShared>,
}

impl LinkAdapter {
    pub fn new(config: LinkConfig, channel: ChannelConfig) -> Self {
        let status = LinkStatus {
            bandwidth_estimate: config.bandwidth_floor_bps,
            ..LinkStatus::default()
        };
        let (snapshot, _) = watch::channel(LinkSnapshot::new(status.clone(), Instant::now()));

        let state = LinkState {
            next_sequence: 0,
            queue: BinaryHeap::new(),
            pending: BTreeMap::new(),
            receive_buffer: VecDeque::with_capacity(config.receive_buffer),
            latency_history: VecDeque::with_capacity(config.latency_history),
            acked: VecDeque::new(),
            last_acked_keyframe: None,
            channel: SimulatedChannel::new(channel),
            credit: 0.0,
            last_tick: None,
            floor_ticks: 0,
            status,
            closed: false,
        };

        LinkAdapter {
            shared: Arc::new(LinkShared {
                config,
                state: Mutex::new(state),
                snapshot,
            }),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    /// Queue a payload. See [`LinkAdapter::send_at`].
    pub fn send(&self, payload: impl Into<Bytes>, priority: u8) -> Option<u64> {
        self.send_at(payload, priority, Instant::now())
    }

    /// Queue a payload stamped at `now`.
    ///
    /// Returns the sequence number, or `None` (logged) when the link is
    /// closed, the payload is oversized or the queue is full.
    pub fn send_at(&self, payload: impl Into<Bytes>, priority: u8, now: Instant) -> Option<u64> {
        match self.try_send_at(payload.into(), priority, now) {
            Ok(sequence) => Some(sequence),
            Err(e) => {
                warn!(error = %e, priority, "send dropped");
                None
            }
        }
    }

    /// Queue a payload, reporting why it was refused
    pub fn try_send_at(&self, payload: Bytes, priority: u8, now: Instant) -> SkylinkResult<u64> {
        let config = &self.shared.config;
        let mut state = self.shared.state.lock();

        if state.closed {
            return Err(SkylinkError::LinkClosed);
        }
        if payload.len() > config.max_payload_bytes {
            return Err(SkylinkError::TransportError(format!(
                "payload of {} bytes exceeds {}",
                payload.len(),
                config.max_payload_bytes
            )));
        }
        if state.queue.len() >= config.max_queue {
            return Err(SkylinkError::TransportError("send queue full".into()));
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.pending.insert(
            sequence,
            PendingPacket {
                sequence,
                payload,
                priority,
                send_timestamp: now,
                transmitted_at: None,
                retry_count: 0,
                on_air: false,
            },
        );
        state.queue.push(Reverse((priority, sequence)));
        state.status.packets_sent += 1;
        Ok(sequence)
    }

    /// Oldest received payload, if any, without waiting
    pub fn try_receive(&self) -> Option<Bytes> {
        self.shared.state.lock().receive_buffer.pop_front()
    }

    /// Oldest received payload, polling until one arrives or `timeout` passes.
    ///
    /// The lock is never held across the sleep.
    pub async fn receive(&self, timeout: Duration) -> Option<Bytes> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(payload) = self.try_receive() {
                return Some(payload);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let wait = self.shared.config.receive_poll().min(deadline - now);
            tokio::time::sleep(wait).await;
        }
    }

    /// Current status, flagged stale if the monitor has gone quiet
    pub fn link_status(&self) -> LinkStatus {
        self.link_status_at(Instant::now())
    }

    pub fn link_status_at(&self, now: Instant) -> LinkStatus {
        self.shared
            .snapshot
            .borrow()
            .status_at(now, self.shared.config.stale_after())
    }

    /// Watch status snapshots as the monitor publishes them
    pub fn subscribe(&self) -> watch::Receiver<LinkSnapshot> {
        self.shared.snapshot.subscribe()
    }

    /// Payload bytes still waiting for the channel, as of now
    pub fn queued_bytes(&self) -> usize {
        self.shared.state.lock().queued_bytes()
    }

    /// Next sequence number that `send` would hand out
    pub fn next_sequence(&self) -> u64 {
        self.shared.state.lock().next_sequence
    }

    /// Flush all queued, pending, in-flight and received data and drop the
    /// bandwidth estimate to its floor. Sequence numbers keep counting.
    pub fn emergency_mode(&self) {
        self.emergency_mode_at(Instant::now());
    }

    pub fn emergency_mode_at(&self, now: Instant) {
        let config = &self.shared.config;
        let status = {
            let mut state = self.shared.state.lock();
            let flushed = state.pending.len();
            state.queue.clear();
            state.pending.clear();
            state.receive_buffer.clear();
            state.acked.clear();
            state.channel.clear();
            state.credit = 0.0;
            state.status.bandwidth_estimate = config.bandwidth_floor_bps;
            state.status.queue_depth = 0;
            state.status.queued_bytes = 0;
            state.status.pending = 0;
            warn!(flushed, "link emergency reset");
            state.status.clone()
        };
        self.publish(status, now);
    }

    /// Run one monitor step at `now` and publish the result
    pub fn tick(&self, now: Instant) -> LinkStatus {
        let config = &self.shared.config;
        let status = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;

            state.transmit(config, now);
            state.collect(config, now);
            state.update_loss(config, now);
            state.retransmit(config, now);
            state.evict(config, now);
            state.update_quality();
            state.update_bandwidth(config, now);

            state.status.queue_depth = state.queue.len();
            state.status.queued_bytes = state.queued_bytes();
            state.status.pending = state.pending.len();
            state.status.clone()
        };
        self.publish(status.clone(), now);
        status
    }

    /// Spawn the monitor loop on the current tokio runtime
    pub fn spawn_monitor(&self) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let adapter = self.clone();
        let period = self.shared.config.monitor_interval();

        let task = tokio::spawn(async move {
            info!(interval = ?period, "link monitor started");
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        adapter.tick(Instant::now());
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("link monitor stopped");
        });

        MonitorHandle {
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }

    /// Refuse further sends and empty all buffers
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.queue.clear();
        state.pending.clear();
        state.receive_buffer.clear();
        state.channel.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    fn publish(&self, status: LinkStatus, now: Instant) {
        self.shared
            .snapshot
            .send_replace(LinkSnapshot::new(status, now));
    }
}

impl LinkState {
    fn queued_bytes(&self) -> usize {
        self.pending
            .values()
            .filter(|p| !p.on_air)
            .map(|p| p.payload.len())
            .sum()
    }

    /// Move queued packets onto the channel within the capacity credit
    fn transmit(&mut self, config: &LinkConfig, now: Instant) {
        let elapsed = match self.last_tick {
            Some(last) => now.saturating_duration_since(last),
            None => config.monitor_interval(),
        };
        self.last_tick = Some(now);

        let rate = self.channel.config().bytes_per_second();
        let burst = rate.max(config.max_payload_bytes as f64);
        self.credit = (self.credit + rate * elapsed.as_secs_f64()).min(burst);

        while let Some(&Reverse((_, sequence))) = self.queue.peek() {
            let Some(packet) = self.pending.get_mut(&sequence) else {
                // Acked or evicted while queued.
                self.queue.pop();
                continue;
            };
            let size = packet.payload.len() as f64;
            if size > self.credit {
                break;
            }
            self.queue.pop();
            self.credit -= size;
            packet.on_air = true;
            packet.transmitted_at = Some(now);
            let payload = packet.payload.clone();
            if !self.channel.transmit(sequence, payload, now) {
                debug!(sequence, "channel dropped packet");
            }
        }
    }

    /// Acknowledge deliveries and hand them to the receive side
    fn collect(&mut self, config: &LinkConfig, now: Instant) {
        for delivery in self.channel.deliver(now) {
            let Some(packet) = self.pending.remove(&delivery.sequence) else {
                continue;
            };
            // Airtime only; waiting for credit is the sender's backlog.
            let sent_at = packet.transmitted_at.unwrap_or(packet.send_timestamp);
            let latency = delivery
                .delivered_at
                .saturating_duration_since(sent_at)
                .as_secs_f64();
            if self.latency_history.len() == config.latency_history {
                self.latency_history.pop_front();
            }
            self.latency_history.push_back(latency);

            self.acked.push_back((now, packet.payload.len()));
            self.status.packets_acked += 1;
            if packet.priority == 0 {
                self.last_acked_keyframe = self.last_acked_keyframe.max(Some(packet.sequence));
            }

            if self.receive_buffer.len() == config.receive_buffer {
                self.receive_buffer.pop_front();
            }
            self.receive_buffer.push_back(delivery.payload);
        }
    }

    fn update_loss(&mut self, config: &LinkConfig, now: Instant) {
        if self.pending.is_empty() {
            return;
        }
        let overdue = self
            .pending
            .values()
            .filter(|p| p.age(now) > config.ack_timeout())
            .count();
        self.status.packet_loss_rate = overdue as f64 / self.pending.len() as f64;
    }

    /// Give overdue keyframes one more chance, unless a newer one got through
    fn retransmit(&mut self, config: &LinkConfig, now: Instant) {
        let superseded = self.last_acked_keyframe;
        for packet in self.pending.values_mut() {
            if packet.priority == 0
                && packet.retry_count < config.max_retries
                && packet.airtime(now).is_some_and(|t| t > config.ack_timeout())
                && superseded.map_or(true, |newest| newest < packet.sequence)
            {
                packet.retry_count += 1;
                packet.send_timestamp = now;
                packet.on_air = false;
                self.queue.push(Reverse((packet.priority, packet.sequence)));
                debug!(sequence = packet.sequence, "retransmitting");
            }
        }
    }

    fn evict(&mut self, config: &LinkConfig, now: Instant) {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.age(now) <= config.eviction());
        let evicted = before - self.pending.len();
        if evicted > 0 {
            self.status.packets_lost += evicted as u64;
            debug!(evicted, "pending packets expired");
        }
    }

    fn update_quality(&mut self) {
        if self.latency_history.is_empty() {
            return;
        }
        let average =
            self.latency_history.iter().sum::<f64>() / self.latency_history.len() as f64;
        self.status.average_latency = average;
        self.status.quality = link_quality(average);
        self.status.signal_strength = self.status.quality;
    }

    fn update_bandwidth(&mut self, config: &LinkConfig, now: Instant) {
        let window = config.bandwidth_window();
        while self
            .acked
            .front()
            .is_some_and(|(at, _)| now.saturating_duration_since(*at) >= window)
        {
            self.acked.pop_front();
        }

        // What the channel actually carried: bytes on air or acked inside
        // the window. Queued bytes are demand, not throughput.
        let on_air: usize = self
            .pending
            .values()
            .filter(|p| p.airtime(now).is_some_and(|t| t < window))
            .map(|p| p.payload.len())
            .sum();
        let acked: usize = self.acked.iter().map(|(_, bytes)| bytes).sum();

        let estimate = (((on_air + acked) * 8) as f64 / window.as_secs_f64())
            .clamp(config.bandwidth_floor_bps, config.bandwidth_ceiling_bps);
        self.status.bandwidth_estimate = estimate;

        if estimate <= config.bandwidth_floor_bps {
            self.floor_ticks = self.floor_ticks.saturating_add(1);
        } else {
            self.floor_ticks = 0;
        }
        self.status.saturated = self.floor_ticks >= config.saturation_ticks;
    }
}

/// Handle to a running monitor task
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Ask the loop to exit at its next wake; does not wait
    pub fn signal(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal and wait for the loop to finish
    pub async fn shutdown(mut self) {
        self.signal();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "link monitor task failed");
            }
        }
    }

}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.signal();
    }
}
