//! Container source collaborator.
//!
//! The engine does not parse containers itself; it consumes an already
//! parsed packet stream through the [`Source`] trait. Any container parser
//! (MKV, MP4, TS, a network receiver) can sit behind it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ContainerProfile;
use crate::packet::{MediaType, SideDataKind, Ticks};

/// Rational time base converting container ticks into 100 ns presentation
/// ticks: `presentation = raw * num / den`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

impl Rational {
    /// Container ticks are microseconds.
    pub const MICROSECONDS: Rational = Rational { num: 10, den: 1 };
    /// Container ticks are milliseconds.
    pub const MILLISECONDS: Rational = Rational { num: 10_000, den: 1 };
    /// Container ticks already are 100 ns ticks.
    pub const TICKS: Rational = Rational { num: 1, den: 1 };

    pub fn new(num: u32, den: u32) -> Self {
        debug_assert!(den != 0, "zero denominator time base");
        Self { num, den }
    }
}

/// One elementary stream as described by the container headers.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    /// Container stream index, used as the stream id throughout the engine
    pub index: u32,
    pub media_type: MediaType,
    /// Human-readable name or language tag, if the container carries one
    pub title: Option<String>,
    pub time_base: Rational,
}

/// A packet as read from the container, before timestamp normalization.
#[derive(Debug, Default)]
pub struct RawPacket {
    pub stream_index: u32,
    /// Presentation timestamp in container ticks, `None` when unknown
    pub pts: Option<i64>,
    /// Decode timestamp in container ticks, `None` when unknown
    pub dts: Option<i64>,
    /// Duration in container ticks; zero or negative means unknown
    pub duration: i64,
    /// Container-reported keyframe flag
    pub key: bool,
    /// Payload bytes, usually a view into the parser's read buffer; the
    /// engine copies them into an owned packet before dispatch
    pub data: Bytes,
    pub side_data: Vec<(SideDataKind, Bytes)>,
    /// Present when the stream format changed at this packet
    pub new_media_type: Option<MediaType>,
}

/// Result of one read attempt.
#[derive(Debug)]
pub enum ReadOutcome {
    Packet(RawPacket),
    EndOfStream,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Transient condition (I/O timeout); the read loop retries
    #[error("read would block, try again")]
    TryAgain,

    /// One unusable packet; dropped, the loop continues
    #[error("corrupt packet: {0}")]
    Corrupt(String),

    /// Unrecoverable parse failure; halts the producer
    #[error("fatal parse error: {0}")]
    Fatal(String),

    /// Requested position cannot be reached
    #[error("seek failed: {0}")]
    SeekFailed(String),
}

/// Abstract container reader consumed by the demux engine.
///
/// `Send` because ownership moves into the producer thread for the lifetime
/// of a start/stop cycle.
pub trait Source: Send {
    /// Elementary streams found in the container headers.
    fn streams(&self) -> &[StreamDescriptor];

    /// Container-kind correction rules (see [`ContainerProfile`]).
    fn profile(&self) -> ContainerProfile {
        ContainerProfile::default()
    }

    /// Start time of the container in presentation ticks, subtracted during
    /// normalization so delivered times are zero-based. Zero for containers
    /// whose timestamps already start at zero.
    fn start_offset(&self) -> Ticks {
        0
    }

    /// Total duration in presentation ticks, if the container knows it.
    fn duration(&self) -> Option<Ticks>;

    /// Read the next container packet.
    fn read_packet(&mut self) -> Result<ReadOutcome, SourceError>;

    /// Reposition to the nearest sync point at or before `target`
    /// presentation time. Returns the position actually landed on.
    fn seek_to(&mut self, target: Ticks) -> Result<Ticks, SourceError>;
}
