//! # Output Channel - Per-Stream Dispatch
//!
//! One channel per deliverable elementary stream. The channel owns its
//! packet queue and a dedicated dispatch thread that converts packets into
//! host delivery buffers and pushes them downstream through a
//! [`DeliveryTarget`].
//!
//! ## State machine
//!
//! ```text
//! Idle ──activate──► Streaming ──begin_flush──► Flushing
//!                        ▲                          │
//!                        └────────end_flush─────────┘
//!     Streaming ──deactivate / eos / error──► Stopped
//! ```
//!
//! A delivery error is terminal for this channel only; it is surfaced on
//! the next `status()` call and cleared by an explicit reset (new segment).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::delivery::{DeliveryError, DeliveryTarget, SampleFlags, SampleTiming};
use crate::error::EngineError;
use crate::packet::{MediaType, Packet, Ticks, INVALID_TIME};
use crate::queue::{PacketQueue, QueueEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, no thread running, queue empty
    Idle,
    /// Dispatch thread delivering
    Streaming,
    /// Flush in progress; queue cleared, deliveries abort
    Flushing,
    /// Thread exited (deactivated, end of stream, or delivery error)
    Stopped,
}

/// Per-channel delivery counters.
#[derive(Debug, Clone)]
pub struct ChannelStats {
    pub delivered: u64,
    pub dropped: u64,
    pub last_pts: Ticks,
    pub queued: usize,
}

struct Shared {
    stream_id: AtomicU32,
    queue: PacketQueue,
    state: Mutex<ChannelState>,
    /// In-flight deliveries bail out while set
    abort: AtomicBool,
    /// Dispatch thread exits after the current delivery
    stop: AtomicBool,
    target: Mutex<Option<Arc<dyn DeliveryTarget>>>,
    /// Format to announce before the next delivery (stream rename)
    pending_format: Mutex<Option<MediaType>>,
    error: Mutex<Option<DeliveryError>>,
    /// Active segment start; samples ending at or before it are preroll
    segment_start: AtomicI64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    last_pts: AtomicI64,
    consumer_wait: Duration,
}

pub struct OutputChannel {
    shared: Arc<Shared>,
    /// Acceptable formats, most preferred first
    media_types: Vec<MediaType>,
    /// Text/subtitle-like stream, exempt from starvation checks
    discontinuous: bool,
    min_packets: usize,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OutputChannel {
    pub fn new(
        stream_id: u32,
        media_types: Vec<MediaType>,
        discontinuous: bool,
        config: &EngineConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                stream_id: AtomicU32::new(stream_id),
                queue: PacketQueue::new(),
                state: Mutex::new(ChannelState::Idle),
                abort: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                target: Mutex::new(None),
                pending_format: Mutex::new(None),
                error: Mutex::new(None),
                segment_start: AtomicI64::new(INVALID_TIME),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                last_pts: AtomicI64::new(INVALID_TIME),
                consumer_wait: config.consumer_wait,
            }),
            media_types,
            discontinuous,
            min_packets: config.min_packets_in_queue,
            worker: Mutex::new(None),
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.shared.stream_id.load(Ordering::Relaxed)
    }

    pub fn media_types(&self) -> &[MediaType] {
        &self.media_types
    }

    pub fn is_discontinuous(&self) -> bool {
        self.discontinuous
    }

    /// Attach the downstream consumer, negotiating the first acceptable
    /// format from the preference list.
    pub fn connect(&self, target: Arc<dyn DeliveryTarget>) -> Result<(), DeliveryError> {
        let mut accepted = None;
        for format in &self.media_types {
            match target.set_active_media_format(format) {
                Ok(()) => {
                    accepted = Some(format.clone());
                    break;
                }
                Err(DeliveryError::FormatRejected(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        let Some(format) = accepted else {
            return Err(DeliveryError::FormatRejected(format!(
                "stream {}: no acceptable format",
                self.stream_id()
            )));
        };

        trace!(stream = self.stream_id(), codec = %format.codec, "channel connected");
        *self.shared.target.lock() = Some(target);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.target.lock().is_some()
    }

    /// Spawn the dispatch thread. No-op while already streaming.
    pub fn activate(&self) -> Result<(), EngineError> {
        if !self.is_connected() {
            return Err(EngineError::NotConnected(self.stream_id()));
        }

        let mut worker = self.worker.lock();
        if let Some(handle) = worker.take() {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                *worker = Some(handle);
                return Ok(());
            }
        }

        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.abort.store(false, Ordering::SeqCst);
        *self.shared.state.lock() = ChannelState::Streaming;

        let shared = self.shared.clone();
        *worker = Some(std::thread::spawn(move || dispatch_loop(shared)));
        Ok(())
    }

    /// Signal the thread to exit after any in-flight delivery and join it.
    pub fn deactivate(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        // wake a consumer parked on an empty queue
        self.shared.queue.clear();

        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        *self.shared.state.lock() = ChannelState::Stopped;
    }

    /// Producer side: hand a packet over to this channel's queue.
    pub fn enqueue(&self, packet: Packet) {
        if !self.is_connected() {
            // no consumer downstream, the packet is dropped here
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.shared.queue.enqueue(QueueEntry::Packet(packet));
    }

    /// Producer side: mark that no more data will arrive.
    pub fn signal_end_of_stream(&self) {
        if self.is_connected() {
            self.shared.queue.enqueue(QueueEntry::EndOfStream);
        }
    }

    /// Discard buffered packets and make any in-flight delivery bail out.
    pub fn begin_flush(&self) {
        let mut state = self.shared.state.lock();
        if *state != ChannelState::Streaming {
            return;
        }
        *state = ChannelState::Flushing;
        drop(state);

        self.shared.abort.store(true, Ordering::SeqCst);
        self.shared.queue.clear();
        let target = self.shared.target.lock().clone();
        if let Some(target) = target {
            target.begin_flush();
        }
        debug!(stream = self.stream_id(), "channel flushing");
    }

    /// Resume delivery after a flush.
    pub fn end_flush(&self) {
        let mut state = self.shared.state.lock();
        if *state != ChannelState::Flushing {
            return;
        }
        *state = ChannelState::Streaming;
        drop(state);

        self.shared.abort.store(false, Ordering::SeqCst);
        let target = self.shared.target.lock().clone();
        if let Some(target) = target {
            target.end_flush();
        }
    }

    /// Announce a new playback segment downstream. Also the explicit reset
    /// that clears a terminal delivery error and, when the dispatch thread
    /// stopped (end of stream or that error), reaps and respawns it so
    /// delivery resumes in the new segment.
    pub fn new_segment(&self, start: Ticks, stop: Ticks, rate: f64) {
        self.shared.segment_start.store(start, Ordering::SeqCst);
        let had_error = self.shared.error.lock().take().is_some();
        let target = self.shared.target.lock().clone();
        if let Some(target) = target {
            target.deliver_new_segment(start, stop, rate);
        }

        let mut worker = self.worker.lock();
        if let Some(handle) = worker.take() {
            let stopped = had_error
                || handle.is_finished()
                || *self.shared.state.lock() == ChannelState::Stopped;
            if stopped {
                drop(worker);
                let _ = handle.join();
                let _ = self.activate();
            } else {
                *worker = Some(handle);
            }
        }
    }

    /// Queue a format change to announce before the next delivered sample.
    /// Used by runtime stream selection.
    pub fn renegotiate(&self, format: MediaType) {
        *self.shared.pending_format.lock() = Some(format);
    }

    /// Re-key this channel to a different container stream index.
    pub fn retag(&self, new_id: u32) {
        self.shared.stream_id.store(new_id, Ordering::SeqCst);
    }

    /// Backpressure signal: a connected, non-discontinuous channel whose
    /// queue has drained below the low-water mark.
    pub fn is_drying(&self) -> bool {
        if self.discontinuous || !self.is_connected() {
            return false;
        }
        if *self.shared.state.lock() != ChannelState::Streaming {
            return false;
        }
        self.shared.queue.len() < self.min_packets
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.lock()
    }

    /// Channel state, or the terminal delivery error if one occurred.
    pub fn status(&self) -> Result<ChannelState, DeliveryError> {
        if let Some(err) = self.shared.error.lock().clone() {
            return Err(err);
        }
        Ok(self.state())
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            last_pts: self.shared.last_pts.load(Ordering::Relaxed),
            queued: self.shared.queue.len(),
        }
    }
}

impl Drop for OutputChannel {
    fn drop(&mut self) {
        self.deactivate();
    }
}

fn dispatch_loop(shared: Arc<Shared>) {
    let stream = shared.stream_id.load(Ordering::Relaxed);
    let Some(target) = shared.target.lock().clone() else {
        return;
    };
    debug!(stream, "dispatch thread started");

    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }
        let Some(entry) = shared.queue.dequeue_timeout(shared.consumer_wait) else {
            continue;
        };
        if shared.abort.load(Ordering::SeqCst) {
            // stale entry dequeued while a flush raced the pop
            shared.dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        match entry {
            QueueEntry::EndOfStream => {
                target.deliver_end_of_stream();
                debug!(stream, "end of stream delivered");
                break;
            }
            QueueEntry::Packet(packet) => {
                if let Err(err) = dispatch_packet(&shared, target.as_ref(), &packet) {
                    if shared.abort.load(Ordering::SeqCst) {
                        // delivery bailed out because of a flush, not a fault
                        continue;
                    }
                    if matches!(err, DeliveryError::Allocation) {
                        // aborts this packet only
                        warn!(stream, "buffer allocation failed, packet skipped");
                        shared.dropped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    warn!(stream, error = %err, "delivery failed, channel halted");
                    *shared.error.lock() = Some(err);
                    break;
                }
                shared.delivered.fetch_add(1, Ordering::Relaxed);
                if packet.pts_start != INVALID_TIME {
                    shared.last_pts.store(packet.pts_start, Ordering::Relaxed);
                }
            }
        }
    }

    *shared.state.lock() = ChannelState::Stopped;
    debug!(stream, "dispatch thread exited");
}

fn dispatch_packet(
    shared: &Shared,
    target: &dyn DeliveryTarget,
    packet: &Packet,
) -> Result<(), DeliveryError> {
    // format change announced before the first sample in the new format
    let pending = shared.pending_format.lock().take();
    if let Some(format) = pending {
        if let Err(err) = target.set_active_media_format(&format) {
            // a failed renegotiation stays pending so a reset retries it
            let mut slot = shared.pending_format.lock();
            if slot.is_none() {
                *slot = Some(format);
            }
            return Err(err);
        }
    } else if let Some(format) = packet.media_type.as_ref() {
        target.set_active_media_format(format)?;
    }

    let needed = packet.len();
    let mut buffer = target.acquire_buffer(needed)?;
    if buffer.capacity() < needed {
        // undersized allocator, grow and retry once
        buffer = target.acquire_buffer(needed)?;
        if buffer.capacity() < needed {
            return Err(DeliveryError::BufferTooSmall {
                needed,
                got: buffer.capacity(),
            });
        }
    }
    buffer.fill(packet.payload())?;

    let timing = SampleTiming {
        start: packet.pts_start,
        stop: packet.pts_stop,
    };
    let segment_start = shared.segment_start.load(Ordering::SeqCst);
    let flags = SampleFlags {
        sync_point: packet.sync_point,
        discontinuity: packet.discontinuity,
        preroll: segment_start != INVALID_TIME
            && packet.has_valid_times()
            && packet.pts_stop <= segment_start,
    };

    target.deliver_sample(buffer, timing, flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::SampleBuffer;
    use crate::packet::StreamKind;
    use parking_lot::Mutex as PlMutex;
    use std::time::Instant;

    #[derive(Debug, PartialEq)]
    enum SinkEvent {
        Format(String),
        Sample(Vec<u8>, SampleTiming, SampleFlags),
        Eos,
        BeginFlush,
        EndFlush,
        Segment(Ticks, Ticks),
    }

    #[derive(Default)]
    struct RecordingSink {
        events: PlMutex<Vec<SinkEvent>>,
        fail_delivery: AtomicBool,
        fail_alloc: AtomicBool,
        fail_format: AtomicBool,
    }

    impl DeliveryTarget for RecordingSink {
        fn set_active_media_format(&self, format: &MediaType) -> Result<(), DeliveryError> {
            if self.fail_format.load(Ordering::SeqCst) {
                return Err(DeliveryError::FormatRejected(format.codec.clone()));
            }
            self.events
                .lock()
                .push(SinkEvent::Format(format.codec.clone()));
            Ok(())
        }

        fn acquire_buffer(&self, min_len: usize) -> Result<SampleBuffer, DeliveryError> {
            if self.fail_alloc.load(Ordering::SeqCst) {
                return Err(DeliveryError::Allocation);
            }
            Ok(SampleBuffer::with_capacity(min_len))
        }

        fn deliver_sample(
            &self,
            buffer: SampleBuffer,
            timing: SampleTiming,
            flags: SampleFlags,
        ) -> Result<(), DeliveryError> {
            if self.fail_delivery.load(Ordering::SeqCst) {
                return Err(DeliveryError::Rejected("sink offline".into()));
            }
            self.events
                .lock()
                .push(SinkEvent::Sample(buffer.as_bytes().to_vec(), timing, flags));
            Ok(())
        }

        fn deliver_end_of_stream(&self) {
            self.events.lock().push(SinkEvent::Eos);
        }

        fn begin_flush(&self) {
            self.events.lock().push(SinkEvent::BeginFlush);
        }

        fn end_flush(&self) {
            self.events.lock().push(SinkEvent::EndFlush);
        }

        fn deliver_new_segment(&self, start: Ticks, stop: Ticks, _rate: f64) {
            self.events.lock().push(SinkEvent::Segment(start, stop));
        }
    }

    fn test_channel() -> (OutputChannel, Arc<RecordingSink>) {
        let config = EngineConfig {
            consumer_wait: Duration::from_millis(2),
            ..Default::default()
        };
        let channel = OutputChannel::new(
            1,
            vec![MediaType::new(StreamKind::Audio, "aac")],
            false,
            &config,
        );
        let sink = Arc::new(RecordingSink::default());
        channel.connect(sink.clone()).unwrap();
        (channel, sink)
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn timed_packet(start: Ticks, stop: Ticks, tag: u8) -> Packet {
        let mut pkt = Packet::new(1, vec![tag]);
        pkt.set_times(start, stop);
        pkt.sync_point = true;
        pkt
    }

    #[test]
    fn test_delivers_in_fifo_order_then_eos() {
        let (channel, sink) = test_channel();
        channel.activate().unwrap();

        channel.enqueue(timed_packet(0, 10, 1));
        channel.enqueue(timed_packet(10, 20, 2));
        channel.signal_end_of_stream();

        wait_for(|| sink.events.lock().iter().any(|e| *e == SinkEvent::Eos));
        channel.deactivate();

        let events = sink.events.lock();
        let payloads: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Sample(data, _, _) => Some(data[0]),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec![1, 2]);
        assert_eq!(*events.last().unwrap(), SinkEvent::Eos);
    }

    #[test]
    fn test_flush_clears_queue_and_propagates() {
        let (channel, sink) = test_channel();
        channel.activate().unwrap();
        wait_for(|| channel.state() == ChannelState::Streaming);

        channel.begin_flush();
        assert_eq!(channel.state(), ChannelState::Flushing);
        // enqueued mid-flush, dropped by the abort check
        channel.enqueue(timed_packet(0, 10, 9));
        wait_for(|| channel.stats().dropped >= 1 && channel.queue_len() == 0);
        channel.end_flush();

        channel.enqueue(timed_packet(20, 30, 5));
        wait_for(|| channel.stats().delivered >= 1);
        channel.deactivate();

        let events = sink.events.lock();
        assert!(events.contains(&SinkEvent::BeginFlush));
        assert!(events.contains(&SinkEvent::EndFlush));
        let delivered: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Sample(data, _, _) => Some(data[0]),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![5]);
    }

    #[test]
    fn test_flush_on_empty_queue_is_idempotent() {
        let (channel, sink) = test_channel();
        channel.activate().unwrap();

        channel.begin_flush();
        channel.begin_flush();
        channel.end_flush();
        channel.end_flush();

        channel.enqueue(timed_packet(0, 10, 1));
        wait_for(|| channel.stats().delivered == 1);
        channel.deactivate();

        let samples = sink
            .events
            .lock()
            .iter()
            .filter(|e| matches!(e, SinkEvent::Sample(..)))
            .count();
        assert_eq!(samples, 1);
    }

    #[test]
    fn test_delivery_error_is_terminal_until_new_segment() {
        let (channel, sink) = test_channel();
        channel.activate().unwrap();

        sink.fail_delivery.store(true, Ordering::SeqCst);
        channel.enqueue(timed_packet(0, 10, 1));
        wait_for(|| channel.status().is_err());
        assert_eq!(channel.state(), ChannelState::Stopped);

        // explicit reset: new segment clears the error and restarts
        sink.fail_delivery.store(false, Ordering::SeqCst);
        channel.new_segment(0, 1_000, 1.0);
        assert!(channel.status().is_ok());

        channel.enqueue(timed_packet(20, 30, 2));
        wait_for(|| channel.stats().delivered >= 1);
        channel.deactivate();
    }

    #[test]
    fn test_allocation_failure_skips_packet_only() {
        let (channel, sink) = test_channel();
        channel.activate().unwrap();

        sink.fail_alloc.store(true, Ordering::SeqCst);
        channel.enqueue(timed_packet(0, 10, 1));
        wait_for(|| channel.stats().dropped >= 1);
        assert!(
            channel.status().is_ok(),
            "allocation failure must not halt the channel"
        );

        sink.fail_alloc.store(false, Ordering::SeqCst);
        channel.enqueue(timed_packet(10, 20, 2));
        wait_for(|| channel.stats().delivered >= 1);
        channel.deactivate();

        let delivered: Vec<u8> = sink
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Sample(data, _, _) => Some(data[0]),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![2]);
    }

    #[test]
    fn test_new_segment_restarts_channel_after_end_of_stream() {
        let (channel, sink) = test_channel();
        channel.activate().unwrap();

        channel.enqueue(timed_packet(0, 10, 1));
        channel.signal_end_of_stream();
        wait_for(|| sink.events.lock().contains(&SinkEvent::Eos));
        wait_for(|| channel.state() == ChannelState::Stopped);

        // the reset that follows a seek revives the stopped dispatch thread
        channel.new_segment(0, 1_000, 1.0);
        channel.enqueue(timed_packet(20, 30, 2));
        wait_for(|| channel.stats().delivered >= 2);
        channel.deactivate();
    }

    #[test]
    fn test_failed_renegotiation_retried_after_reset() {
        let (channel, sink) = test_channel();
        channel.activate().unwrap();

        channel.renegotiate(MediaType::new(StreamKind::Audio, "ac3"));
        sink.fail_format.store(true, Ordering::SeqCst);
        channel.enqueue(timed_packet(0, 10, 1));
        wait_for(|| channel.status().is_err());

        sink.fail_format.store(false, Ordering::SeqCst);
        channel.new_segment(0, 1_000, 1.0);
        channel.enqueue(timed_packet(10, 20, 2));
        wait_for(|| channel.stats().delivered >= 1);
        channel.deactivate();

        let events = sink.events.lock();
        let ac3 = events
            .iter()
            .position(|e| *e == SinkEvent::Format("ac3".into()))
            .expect("renegotiation retried after reset");
        let sample = events
            .iter()
            .position(|e| matches!(e, SinkEvent::Sample(data, _, _) if data[0] == 2))
            .expect("sample under the renegotiated format");
        assert!(ac3 < sample);
    }

    #[test]
    fn test_preroll_flag_before_segment_start() {
        let (channel, sink) = test_channel();
        channel.new_segment(100, 1_000, 1.0);
        channel.activate().unwrap();

        channel.enqueue(timed_packet(0, 50, 1)); // ends before segment start
        channel.enqueue(timed_packet(100, 200, 2));
        wait_for(|| channel.stats().delivered == 2);
        channel.deactivate();

        let events = sink.events.lock();
        let flags: Vec<SampleFlags> = events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Sample(_, _, f) => Some(*f),
                _ => None,
            })
            .collect();
        assert!(flags[0].preroll);
        assert!(!flags[1].preroll);
    }

    #[test]
    fn test_drying_indicator() {
        let config = EngineConfig {
            min_packets_in_queue: 2,
            consumer_wait: Duration::from_millis(2),
            ..Default::default()
        };
        let channel = OutputChannel::new(
            1,
            vec![MediaType::new(StreamKind::Subtitle, "srt")],
            true,
            &config,
        );
        // discontinuous streams never report drying
        assert!(!channel.is_drying());

        let audio = OutputChannel::new(
            2,
            vec![MediaType::new(StreamKind::Audio, "aac")],
            false,
            &config,
        );
        let sink = Arc::new(RecordingSink::default());
        audio.connect(sink).unwrap();
        audio.activate().unwrap();
        assert!(audio.is_drying());
        audio.deactivate();
    }
}
