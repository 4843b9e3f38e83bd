//! The fixed-cadence frame scheduler.
//!
//! One cooperative loop owns the whole mixing pipeline. Each tick it
//! drains the ingest inbox, realigns every source, produces one mix per
//! eligible listener, hands the frames to the transport, advances every
//! sampled cursor exactly once, then sleeps out the remainder of the
//! 10 ms budget. The realized sleep feeds the throttle controller.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use audio::mix::{mix_for_listener, MixFrame};
use audio::registry::Registry;
use log::{debug, info};
use mixer_core::{Error, PeerId, BUFFER_SEND_INTERVAL_USECS};
use network::protocol;
use network::transport::Transport;
use tokio::time::{sleep_until, Duration, Instant};

use crate::ingest;
use crate::stats::MixStatistics;
use crate::throttle::ThrottleController;

/// How often each listener receives a stream-stats datagram.
const STREAM_STATS_INTERVAL: Duration = Duration::from_secs(1);

pub struct FrameScheduler<T: Transport> {
    transport: T,
    registry: Registry,
    throttle: ThrottleController,
    config: crate::MixerConfig,
    stats: MixStatistics,
    sequences: BTreeMap<PeerId, u16>,
    scratch: MixFrame,
    send_buf: Vec<u8>,
    last_stream_stats: Instant,
    stop: Arc<AtomicBool>,
}

impl<T: Transport> FrameScheduler<T> {
    pub fn new(transport: T, config: crate::MixerConfig) -> Self {
        Self {
            transport,
            registry: Registry::new(config.dynamic_jitter_buffers),
            throttle: ThrottleController::new(),
            config,
            stats: MixStatistics::new(),
            sequences: BTreeMap::new(),
            scratch: MixFrame::new(),
            send_buf: Vec::new(),
            last_stream_stats: Instant::now(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag observed at tick boundaries; setting it stops the loop.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn stats(&self) -> &MixStatistics {
        &self.stats
    }

    pub fn throttle(&self) -> &ThrottleController {
        &self.throttle
    }

    /// Run until the stop flag is raised. Suspends only while sleeping
    /// out the tail of a tick.
    pub async fn run(&mut self) {
        info!(
            "mixer loop started, {} us per frame",
            BUFFER_SEND_INTERVAL_USECS
        );
        let start = Instant::now();
        let mut next_frame: u64 = 0;

        while !self.stop.load(Ordering::Relaxed) {
            self.run_tick();

            next_frame += 1;
            let target = start + Duration::from_micros(next_frame * BUFFER_SEND_INTERVAL_USECS);
            let usecs_to_sleep = target
                .saturating_duration_since(Instant::now())
                .as_micros() as u64;

            if usecs_to_sleep > 0 {
                sleep_until(target).await;
            } else {
                // Blown budget: record it and give the runtime a breath.
                self.stats.overrun_ticks += 1;
                tokio::task::yield_now().await;
            }
            self.throttle.record_sleep(usecs_to_sleep);
        }
        info!("mixer loop stopped after {} frames", next_frame);
    }

    /// One tick of the pipeline, without the pacing sleep.
    pub fn run_tick(&mut self) {
        ingest::drain_datagrams(&mut self.transport, &mut self.registry, &mut self.stats);

        self.registry.pre_frame();

        let stats_bytes = self.stream_stats_if_due();

        let listeners: Vec<PeerId> = self.registry.peers().collect();
        for listener in listeners {
            if !self.registry.listener_ready(listener) || !self.transport.is_connected(listener) {
                continue;
            }
            self.mix_and_send(listener, stats_bytes.as_deref());
        }

        if stats_bytes.is_some() {
            self.stats.reset_window();
        }

        self.registry.post_frame();
        self.stats.num_stat_frames += 1;
    }

    fn mix_and_send(&mut self, listener: PeerId, stats_bytes: Option<&[u8]>) {
        let threshold = self.throttle.min_audibility_threshold();
        let mixes = mix_for_listener(
            &self.registry,
            listener,
            threshold,
            self.config.zones.as_ref(),
            &mut self.scratch,
        );
        self.stats.sum_mixes += mixes as u64;
        self.stats.sum_listeners += 1;

        let sequence = self.sequences.entry(listener).or_insert(0);
        protocol::encode_mixed_audio(&mut self.send_buf, *sequence, self.scratch.samples());

        match self.transport.send_datagram(listener, &self.send_buf) {
            Ok(()) => {}
            Err(Error::Backpressure(peer)) => {
                // The frame is lost but the sequence still advances, so
                // the listener sees a gap instead of a stall.
                debug!("backpressure, dropped frame {} for {}", sequence, peer);
            }
            Err(e) => debug!("send to {} failed: {}", listener, e),
        }
        *sequence = sequence.wrapping_add(1);

        if let Some(bytes) = stats_bytes {
            if let Err(e) = self.transport.send_datagram(listener, bytes) {
                debug!("stats send to {} failed: {}", listener, e);
            }
        }
    }

    /// Encode one stream-stats packet per interval; the same bytes go to
    /// every listener mixed this tick.
    fn stream_stats_if_due(&mut self) -> Option<Vec<u8>> {
        if self.last_stream_stats.elapsed() < STREAM_STATS_INTERVAL {
            return None;
        }
        self.last_stream_stats = Instant::now();
        match self.stats.snapshot(&self.throttle).encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!("failed to encode stream stats: {}", e);
                None
            }
        }
    }
}
