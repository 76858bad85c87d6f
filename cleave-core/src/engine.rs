//! # Demux Engine - Producer Loop, Timestamp Normalization, Seek
//!
//! The engine owns the container source and runs the single producer
//! thread: read a container packet, classify it through the stream catalog,
//! normalize its timestamps into 100 ns presentation ticks, and fan it out
//! to the owning output channel. Backpressure pauses reading when every
//! active channel is sufficiently buffered; seeks and stream selection are
//! serviced as control commands checked at the top of every loop cycle.
//!
//! ```text
//! ┌────────┐   read    ┌─────────────┐  enqueue  ┌───────────────┐
//! │ Source │──────────►│ DemuxEngine │──────────►│ OutputChannel │×N
//! └────────┘           │  (producer) │           │  (consumer)   │
//!                      └─────────────┘           └───────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::catalog::StreamCatalog;
use crate::channel::OutputChannel;
use crate::config::{ContainerProfile, EngineConfig};
use crate::delivery::{DeliveryError, DeliveryTarget};
use crate::error::EngineError;
use crate::packet::{Packet, StreamKind, Ticks, INVALID_TIME};
use crate::source::{Rational, RawPacket, ReadOutcome, Source, SourceError, StreamDescriptor};

// ============================================================================
// Control plane
// ============================================================================

/// Commands shared between the host-facing API and the producer thread.
/// The seek slot is overwritten on every post, so of several seeks issued
/// before the producer services them only the latest is honored.
struct Control {
    stop: AtomicBool,
    paused: AtomicBool,
    pending_seek: Mutex<Option<Ticks>>,
    pending_select: Mutex<Option<u32>>,
}

impl Control {
    fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            pending_seek: Mutex::new(None),
            pending_select: Mutex::new(None),
        }
    }

    fn reset(&self) {
        self.stop.store(false, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        *self.pending_seek.lock() = None;
        *self.pending_select.lock() = None;
    }
}

#[derive(Default)]
struct SharedStats {
    packets_read: AtomicU64,
    packets_discarded: AtomicU64,
    corrupt_dropped: AtomicU64,
}

/// Snapshot of engine counters.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub packets_read: u64,
    pub packets_discarded: u64,
    pub corrupt_dropped: u64,
    pub position: Ticks,
}

// ============================================================================
// Timestamp normalization
// ============================================================================

/// Apply the container's zero-sentinel rule to one raw timestamp.
fn effective_timestamp(raw: Option<i64>, profile: &ContainerProfile) -> Option<i64> {
    match raw {
        Some(0) if profile.treat_zero_as_unknown => None,
        other => other,
    }
}

/// Container ticks to 100 ns presentation ticks, computed in double
/// precision to avoid overflow, then rounded. Downstream lip-sync depends
/// on this arithmetic, keep it exact.
fn scale_to_ticks(raw: i64, time_base: Rational) -> Ticks {
    (raw as f64 * time_base.num as f64 / time_base.den as f64).round() as Ticks
}

/// Normalized timing for one packet: (start, stop, sync_point).
///
/// PTS is preferred over DTS; DTS is the fallback, and is forced for video
/// when the container profile says presentation times are unreliable. When
/// neither is valid the stream's previous stop time is reused so the clock
/// keeps advancing. A packet with known positive duration keeps the
/// container's keyframe flag; without one it is demoted to a non-sync,
/// 1-tick interval so stop always exceeds start.
fn normalize_times(
    raw: &RawPacket,
    kind: StreamKind,
    time_base: Rational,
    profile: &ContainerProfile,
    segment_offset: Ticks,
    last_stop: Option<Ticks>,
) -> (Ticks, Ticks, bool) {
    let pts = effective_timestamp(raw.pts, profile);
    let dts = effective_timestamp(raw.dts, profile);

    let chosen = if profile.prefer_dts_for_video && kind == StreamKind::Video {
        dts
    } else {
        pts.or(dts)
    };

    let start = match chosen {
        Some(v) => scale_to_ticks(v, time_base) - segment_offset,
        None => last_stop.unwrap_or(INVALID_TIME),
    };

    let duration = if raw.duration > 0 {
        scale_to_ticks(raw.duration, time_base).max(1)
    } else {
        0
    };
    let sync = duration > 0 && raw.key;
    let duration = if duration > 0 { duration } else { 1 };

    let stop = if start == INVALID_TIME {
        INVALID_TIME
    } else {
        start + duration
    };
    (start, stop, sync)
}

// ============================================================================
// Producer thread
// ============================================================================

struct Producer {
    source: Box<dyn Source>,
    catalog: Arc<Mutex<StreamCatalog>>,
    control: Arc<Control>,
    config: EngineConfig,
    profile: ContainerProfile,
    descriptors: Vec<StreamDescriptor>,
    time_bases: HashMap<u32, Rational>,
    position: Arc<AtomicI64>,
    fault: Arc<Mutex<Option<EngineError>>>,
    stats: Arc<SharedStats>,
    /// Subtracted during normalization; fixed for the life of the open
    segment_offset: Ticks,
    segment_stop: Ticks,
    /// Streams that received at least one packet since the last flush
    seen: HashSet<u32>,
    /// Previous stop time per stream, the fallback clock
    last_stop: HashMap<u32, Ticks>,
    corrupt_run: u32,
    eos_sent: bool,
}

impl Producer {
    fn run(mut self) -> Box<dyn Source> {
        debug!("producer thread started");

        loop {
            if self.control.stop.load(Ordering::SeqCst) {
                break;
            }
            // control commands take priority over reading; the slot guard
            // must be released before the command runs
            let pending_seek = self.control.pending_seek.lock().take();
            if let Some(target) = pending_seek {
                self.service_seek(target);
                continue;
            }
            let pending_select = self.control.pending_select.lock().take();
            if let Some(stream_id) = pending_select {
                apply_select(&mut self.catalog.lock(), &self.descriptors, stream_id);
                self.seen.remove(&stream_id);
                self.last_stop.remove(&stream_id);
                continue;
            }
            if self.fault.lock().is_some() {
                break;
            }
            if self.control.paused.load(Ordering::SeqCst) || self.eos_sent {
                // parked; stay responsive to seek/stop
                std::thread::sleep(self.config.throttle);
                continue;
            }
            if self.backpressure_holds() {
                std::thread::sleep(self.config.throttle);
                continue;
            }

            match self.source.read_packet() {
                Ok(ReadOutcome::Packet(raw)) => {
                    self.corrupt_run = 0;
                    if let Err(err) = self.dispatch(raw) {
                        match err {
                            EngineError::Allocation(bytes) => {
                                // one packet aborted, the engine survives
                                warn!(bytes, "packet allocation failed, packet skipped");
                                self.stats.packets_discarded.fetch_add(1, Ordering::Relaxed);
                            }
                            other => self.fail(other),
                        }
                    }
                }
                Ok(ReadOutcome::EndOfStream) => {
                    debug!("container end of stream");
                    self.send_eos();
                }
                Err(SourceError::TryAgain) => {
                    std::thread::sleep(self.config.throttle);
                }
                Err(SourceError::Corrupt(msg)) => {
                    warn!(%msg, "corrupt packet dropped");
                    self.stats.corrupt_dropped.fetch_add(1, Ordering::Relaxed);
                    self.corrupt_run += 1;
                    if self.corrupt_run >= self.config.corrupt_packet_limit {
                        self.fail(EngineError::FatalParse(format!(
                            "{} consecutive corrupt packets",
                            self.corrupt_run
                        )));
                    }
                }
                Err(SourceError::Fatal(msg)) | Err(SourceError::SeekFailed(msg)) => {
                    self.fail(EngineError::FatalParse(msg));
                }
            }
        }

        debug!("producer thread exited");
        self.source
    }

    /// True when no active channel is starved and at least one queue sits
    /// at or above the soft cap.
    fn backpressure_holds(&self) -> bool {
        let catalog = self.catalog.lock();
        let mut any_full = false;
        for channel in catalog.channels() {
            if !channel.is_connected() {
                continue;
            }
            if channel.is_drying() {
                return false;
            }
            if channel.queue_len() >= self.config.max_packets_in_queue {
                any_full = true;
            }
        }
        any_full
    }

    fn dispatch(&mut self, raw: RawPacket) -> Result<(), EngineError> {
        let stream_id = raw.stream_index;
        let (channel, kind) = {
            let catalog = self.catalog.lock();
            match (catalog.channel(stream_id), catalog.kind(stream_id)) {
                (Some(ch), Some(kind)) => (ch.clone(), kind),
                _ => {
                    // unmapped stream, discard
                    trace!(stream = stream_id, "packet for unmapped stream discarded");
                    self.stats.packets_discarded.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
            }
        };

        let time_base = self
            .time_bases
            .get(&stream_id)
            .copied()
            .unwrap_or(Rational::TICKS);
        let (start, stop, sync) = normalize_times(
            &raw,
            kind,
            time_base,
            &self.profile,
            self.segment_offset,
            self.last_stop.get(&stream_id).copied(),
        );

        let mut packet = Packet::from_slice(stream_id, &raw.data)?;
        packet.set_times(start, stop);
        packet.sync_point = sync;
        // first packet per stream since the last flush
        packet.discontinuity = self.seen.insert(stream_id);
        packet.media_type = raw.new_media_type;
        for (side_kind, blob) in raw.side_data {
            packet.attach_side_data(side_kind, blob);
        }

        if start != INVALID_TIME {
            self.last_stop.insert(stream_id, stop);
            self.position.store(start, Ordering::Relaxed);
        }

        channel.enqueue(packet);
        self.stats.packets_read.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn service_seek(&mut self, mut target: Ticks) {
        debug!(target, "servicing seek");

        {
            let catalog = self.catalog.lock();
            for channel in catalog.channels() {
                channel.begin_flush();
            }
        }

        // a seek posted while we were flushing supersedes this one
        let superseding = self.control.pending_seek.lock().take();
        if let Some(newer) = superseding {
            target = newer;
        }

        let landed = match self.source.seek_to(target) {
            Ok(landed) => landed,
            Err(err) => {
                // stay at the current position and resume delivery
                warn!(target, %err, "container seek failed");
                self.position.load(Ordering::Relaxed)
            }
        };
        self.position.store(landed, Ordering::Relaxed);

        {
            let catalog = self.catalog.lock();
            for channel in catalog.channels() {
                channel.end_flush();
                channel.new_segment(target, self.segment_stop, 1.0);
            }
        }

        self.seen.clear();
        self.last_stop.clear();
        self.corrupt_run = 0;
        self.eos_sent = false;
        debug!(target, landed, "seek complete");
    }

    fn send_eos(&mut self) {
        if self.eos_sent {
            return;
        }
        let catalog = self.catalog.lock();
        for channel in catalog.channels() {
            channel.signal_end_of_stream();
        }
        self.eos_sent = true;
    }

    fn fail(&mut self, err: EngineError) {
        error!(%err, "producer halted");
        *self.fault.lock() = Some(err);
        self.send_eos();
    }
}

/// Re-route delivery to a different container stream of the same kind.
/// Runs on the producer thread (or before it starts).
fn apply_select(
    catalog: &mut StreamCatalog,
    descriptors: &[StreamDescriptor],
    stream_id: u32,
) -> bool {
    let Some(desc) = descriptors.iter().find(|d| d.index == stream_id) else {
        warn!(stream = stream_id, "select for unknown stream ignored");
        return false;
    };
    if catalog
        .channel(stream_id)
        .is_some_and(|ch| ch.is_connected())
    {
        // already routed to a live consumer
        return true;
    }
    let kind = match desc.media_type.kind {
        StreamKind::Unknown => crate::catalog::classify(&desc.media_type.codec),
        labeled => labeled,
    };
    let Some(old_id) = catalog.id_of_kind(kind) else {
        warn!(stream = stream_id, ?kind, "no active channel of this kind");
        return false;
    };
    catalog.rename_output_channel(old_id, stream_id, desc.media_type.clone())
}

// ============================================================================
// Engine
// ============================================================================

/// One engine per opened source. Owns the stream catalog, the output
/// channels, and the producer thread.
pub struct DemuxEngine {
    config: EngineConfig,
    control: Arc<Control>,
    catalog: Arc<Mutex<StreamCatalog>>,
    descriptors: Vec<StreamDescriptor>,
    profile: ContainerProfile,
    duration: Option<Ticks>,
    start_offset: Ticks,
    position: Arc<AtomicI64>,
    fault: Arc<Mutex<Option<EngineError>>>,
    stats: Arc<SharedStats>,
    source: Option<Box<dyn Source>>,
    worker: Option<JoinHandle<Box<dyn Source>>>,
}

impl DemuxEngine {
    /// Parse the container headers and build one output channel per
    /// deliverable elementary stream.
    pub fn open(source: Box<dyn Source>, config: EngineConfig) -> Result<Self, EngineError> {
        let descriptors = source.streams().to_vec();
        if descriptors.is_empty() {
            return Err(EngineError::Open("container exposes no streams".into()));
        }

        let catalog = StreamCatalog::build(&descriptors, &config);
        if catalog.is_empty() {
            return Err(EngineError::Open("no deliverable streams".into()));
        }
        debug!(
            streams = descriptors.len(),
            deliverable = catalog.len(),
            "container opened"
        );

        let profile = source.profile();
        let duration = source.duration();
        let start_offset = source.start_offset();
        Ok(Self {
            config,
            control: Arc::new(Control::new()),
            catalog: Arc::new(Mutex::new(catalog)),
            descriptors,
            profile,
            duration,
            start_offset,
            position: Arc::new(AtomicI64::new(0)),
            fault: Arc::new(Mutex::new(None)),
            stats: Arc::new(SharedStats::default()),
            source: Some(source),
            worker: None,
        })
    }

    /// Streams found in the container, in container order.
    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.descriptors
    }

    /// Attach a downstream consumer to one stream's channel.
    pub fn connect(
        &self,
        stream_id: u32,
        target: Arc<dyn DeliveryTarget>,
    ) -> Result<(), DeliveryError> {
        let catalog = self.catalog.lock();
        let Some(channel) = catalog.channel(stream_id) else {
            return Err(DeliveryError::Rejected(format!(
                "unknown stream id {stream_id}"
            )));
        };
        channel.connect(target)
    }

    /// The output channel for one stream, if it exists.
    pub fn channel(&self, stream_id: u32) -> Option<Arc<OutputChannel>> {
        self.catalog.lock().channel(stream_id).cloned()
    }

    /// Spawn the producer thread and every connected channel's dispatch
    /// thread. Idempotent while running.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let source = self.source.take().ok_or(EngineError::NotRunning)?;

        self.control.reset();
        *self.fault.lock() = None;

        let segment_stop = self.duration.unwrap_or(INVALID_TIME);
        let start_pos = self.position.load(Ordering::Relaxed);
        {
            let catalog = self.catalog.lock();
            let mut connected = 0usize;
            for channel in catalog.channels() {
                if channel.is_connected() {
                    channel.new_segment(start_pos, segment_stop, 1.0);
                    channel.activate()?;
                    connected += 1;
                }
            }
            if connected == 0 {
                drop(catalog);
                self.source = Some(source);
                return Err(EngineError::NoConsumers);
            }
        }

        let time_bases = self
            .descriptors
            .iter()
            .map(|d| (d.index, d.time_base))
            .collect();
        let producer = Producer {
            source,
            catalog: self.catalog.clone(),
            control: self.control.clone(),
            config: self.config.clone(),
            profile: self.profile,
            descriptors: self.descriptors.clone(),
            time_bases,
            position: self.position.clone(),
            fault: self.fault.clone(),
            stats: self.stats.clone(),
            segment_offset: self.start_offset,
            segment_stop,
            seen: HashSet::new(),
            last_stop: HashMap::new(),
            corrupt_run: 0,
            eos_sent: false,
        };
        self.worker = Some(std::thread::spawn(move || producer.run()));
        Ok(())
    }

    /// Stop the producer and all dispatch threads. The source is retained
    /// so a later `start` resumes from the current position.
    pub fn stop(&mut self) {
        self.control.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(source) => self.source = Some(source),
                Err(_) => error!("producer thread panicked"),
            }
        }
        let catalog = self.catalog.lock();
        for channel in catalog.channels() {
            channel.deactivate();
        }
    }

    /// Request a seek. Returns immediately; the producer drains, flushes,
    /// repositions and restarts delivery. Of several seeks issued before
    /// the first is serviced, only the latest target is honored.
    pub fn seek_to(&self, target: Ticks) -> Result<(), EngineError> {
        if self.worker.is_none() {
            return Err(EngineError::NotRunning);
        }
        *self.control.pending_seek.lock() = Some(target);
        Ok(())
    }

    /// Switch delivery to a different stream of the same kind without a
    /// full re-open (e.g. another audio track).
    pub fn select_stream(&self, stream_id: u32) -> Result<(), EngineError> {
        if !self.descriptors.iter().any(|d| d.index == stream_id) {
            return Err(EngineError::UnknownStream(stream_id));
        }
        if self.worker.is_some() {
            // synchronized with the producer: applied on its thread
            *self.control.pending_select.lock() = Some(stream_id);
        } else {
            apply_select(&mut self.catalog.lock(), &self.descriptors, stream_id);
        }
        Ok(())
    }

    pub fn pause(&self) {
        self.control.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.control.paused.store(false, Ordering::SeqCst);
    }

    /// Last position delivered or landed on by a seek, in 100 ns ticks.
    pub fn get_position(&self) -> Ticks {
        self.position.load(Ordering::Relaxed)
    }

    pub fn get_duration(&self) -> Option<Ticks> {
        self.duration
    }

    /// `Err` once the producer has halted on a fatal error.
    pub fn status(&self) -> Result<(), EngineError> {
        match self.fault.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            packets_read: self.stats.packets_read.load(Ordering::Relaxed),
            packets_discarded: self.stats.packets_discarded.load(Ordering::Relaxed),
            corrupt_dropped: self.stats.corrupt_dropped.load(Ordering::Relaxed),
            position: self.get_position(),
        }
    }

    /// Tear everything down. The engine cannot be restarted afterwards.
    pub fn close(&mut self) {
        self.stop();
        *self.catalog.lock() = StreamCatalog::new();
        self.source = None;
    }
}

impl Drop for DemuxEngine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn raw(pts: Option<i64>, dts: Option<i64>, duration: i64, key: bool) -> RawPacket {
        RawPacket {
            stream_index: 0,
            pts,
            dts,
            duration,
            key,
            data: Bytes::new(),
            side_data: Vec::new(),
            new_media_type: None,
        }
    }

    const US: Rational = Rational::MICROSECONDS;

    #[test]
    fn test_scale_matches_formula() {
        // 90 kHz clock: num/den = 10_000_000 / 90_000
        let tb = Rational::new(1_000_000, 9_000);
        assert_eq!(scale_to_ticks(90_000, tb), 10_000_000);
        assert_eq!(scale_to_ticks(1, tb), 111); // 111.11 rounds down
        assert_eq!(scale_to_ticks(5, tb), 556); // 555.55 rounds up
    }

    #[test]
    fn test_pts_preferred_dts_fallback() {
        let profile = ContainerProfile::default();
        let (start, stop, sync) = normalize_times(
            &raw(Some(100), Some(50), 10, true),
            StreamKind::Audio,
            US,
            &profile,
            0,
            None,
        );
        assert_eq!(start, 1_000);
        assert_eq!(stop, 1_100);
        assert!(sync);

        let (start, _, _) = normalize_times(
            &raw(None, Some(50), 10, true),
            StreamKind::Audio,
            US,
            &profile,
            0,
            None,
        );
        assert_eq!(start, 500);
    }

    #[test]
    fn test_zero_sentinel_rule() {
        let profile = ContainerProfile {
            treat_zero_as_unknown: true,
            ..Default::default()
        };
        // zero pts and dts both remap to unknown; previous stop reused
        let (start, stop, _) = normalize_times(
            &raw(Some(0), Some(0), 10, true),
            StreamKind::Audio,
            US,
            &profile,
            0,
            Some(4_000),
        );
        assert_eq!(start, 4_000);
        assert_eq!(stop, 4_100);

        // with no previous time either, the packet carries no timestamps
        let (start, stop, _) = normalize_times(
            &raw(Some(0), None, 10, true),
            StreamKind::Audio,
            US,
            &profile,
            0,
            None,
        );
        assert_eq!(start, INVALID_TIME);
        assert_eq!(stop, INVALID_TIME);

        // zero stays a real timestamp when the rule is off
        let (start, _, _) = normalize_times(
            &raw(Some(0), None, 10, true),
            StreamKind::Audio,
            US,
            &ContainerProfile::default(),
            0,
            Some(4_000),
        );
        assert_eq!(start, 0);
    }

    #[test]
    fn test_dts_forced_for_video() {
        let profile = ContainerProfile {
            prefer_dts_for_video: true,
            ..Default::default()
        };
        let pkt = raw(Some(100), Some(40), 10, true);
        let (start, _, _) =
            normalize_times(&pkt, StreamKind::Video, US, &profile, 0, None);
        assert_eq!(start, 400);

        // audio keeps its pts
        let (start, _, _) =
            normalize_times(&pkt, StreamKind::Audio, US, &profile, 0, None);
        assert_eq!(start, 1_000);
    }

    #[test]
    fn test_unknown_duration_yields_one_tick_non_sync() {
        let profile = ContainerProfile::default();
        let (start, stop, sync) = normalize_times(
            &raw(Some(100), None, 0, true),
            StreamKind::Video,
            US,
            &profile,
            0,
            None,
        );
        assert_eq!(stop, start + 1);
        assert!(!sync, "keyframe without a known duration is not a sync point");
    }

    #[test]
    fn test_segment_offset_subtracted() {
        let profile = ContainerProfile::default();
        let (start, _, _) = normalize_times(
            &raw(Some(100), None, 10, true),
            StreamKind::Audio,
            US,
            &profile,
            250,
            None,
        );
        assert_eq!(start, 750);
    }
}
