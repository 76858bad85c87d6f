//! # Packet - Demuxed Elementary Stream Data Unit
//!
//! A `Packet` is the unit of data flowing from the demux engine to an
//! output channel: raw payload bytes plus presentation timing, sync-point
//! and discontinuity flags, optional out-of-band side data (HDR metadata
//! and the like), and an optional media-type change annotation used to
//! trigger downstream renegotiation.
//!
//! Once a packet has been enqueued into a channel's queue it is treated as
//! immutable; `append` exists only for reassembling fragmented container
//! records before that point.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Presentation time in 100 ns ticks.
pub type Ticks = i64;

/// Sentinel for "timestamp unknown".
pub const INVALID_TIME: Ticks = i64::MIN;

/// 100 ns ticks per second.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Broad classification of an elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Unknown,
}

/// Out-of-band side data attached to a packet. At most one blob per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideDataKind {
    /// HDR mastering display metadata (primaries, luminance range)
    MasteringDisplay,
    /// HDR content light level (MaxCLL / MaxFALL)
    ContentLightLevel,
}

/// Format descriptor for one elementary stream, used both in the initial
/// stream list and as a mid-stream renegotiation signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    pub kind: StreamKind,
    /// Codec identifier, e.g. "h264", "aac", "pgs"
    pub codec: String,
    /// Codec extradata (SPS/PPS, ASC, ...), opaque to the engine
    pub extradata: Bytes,
}

impl MediaType {
    pub fn new(kind: StreamKind, codec: impl Into<String>) -> Self {
        Self {
            kind,
            codec: codec.into(),
            extradata: Bytes::new(),
        }
    }

    pub fn with_extradata(mut self, extradata: Bytes) -> Self {
        self.extradata = extradata;
        self
    }
}

/// One demuxed data unit.
///
/// Created by the demux engine, moved into an output channel's queue, and
/// consumed exactly once by that channel's dispatch thread.
#[derive(Debug)]
pub struct Packet {
    /// Owning elementary stream; immutable once set
    stream_id: u32,
    /// Payload bytes, owned exclusively by this packet
    payload: Vec<u8>,
    /// Presentation start time, or `INVALID_TIME`
    pub pts_start: Ticks,
    /// Presentation stop time, or `INVALID_TIME`
    pub pts_stop: Ticks,
    /// Decoding may start fresh at this packet
    pub sync_point: bool,
    /// Decode-continuity break before this packet
    pub discontinuity: bool,
    side_data: Vec<(SideDataKind, Bytes)>,
    /// Present only when the stream format changed
    pub media_type: Option<MediaType>,
}

impl Packet {
    /// Create a packet that takes ownership of an already-allocated payload.
    pub fn new(stream_id: u32, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            payload,
            pts_start: INVALID_TIME,
            pts_stop: INVALID_TIME,
            sync_point: false,
            discontinuity: false,
            side_data: Vec::new(),
            media_type: None,
        }
    }

    /// Create a packet by copying payload bytes out of a container-internal
    /// buffer. Fails with `EngineError::Allocation` instead of aborting when
    /// the copy cannot be allocated.
    pub fn from_slice(stream_id: u32, data: &[u8]) -> Result<Self, EngineError> {
        let mut payload = Vec::new();
        payload
            .try_reserve_exact(data.len())
            .map_err(|_| EngineError::Allocation(data.len()))?;
        payload.extend_from_slice(data);
        Ok(Self::new(stream_id, payload))
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Concatenate more payload bytes. Only valid while reassembling a
    /// fragmented container record, before the packet is enqueued.
    pub fn append(&mut self, data: &[u8]) -> Result<(), EngineError> {
        self.payload
            .try_reserve(data.len())
            .map_err(|_| EngineError::Allocation(data.len()))?;
        self.payload.extend_from_slice(data);
        Ok(())
    }

    /// Set presentation bounds. Start must not exceed stop when both are
    /// valid.
    pub fn set_times(&mut self, start: Ticks, stop: Ticks) {
        debug_assert!(
            start == INVALID_TIME || stop == INVALID_TIME || start <= stop,
            "packet start {start} after stop {stop}"
        );
        self.pts_start = start;
        self.pts_stop = stop;
    }

    pub fn has_valid_times(&self) -> bool {
        self.pts_start != INVALID_TIME && self.pts_stop != INVALID_TIME
    }

    /// Attach a side-data blob, replacing any existing blob of the same kind.
    pub fn attach_side_data(&mut self, kind: SideDataKind, blob: Bytes) {
        if let Some(entry) = self.side_data.iter_mut().find(|(k, _)| *k == kind) {
            entry.1 = blob;
        } else {
            self.side_data.push((kind, blob));
        }
    }

    pub fn side_data(&self, kind: SideDataKind) -> Option<&Bytes> {
        self.side_data
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, b)| b)
    }
}
