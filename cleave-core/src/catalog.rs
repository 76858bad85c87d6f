//! # Stream Catalog - Container Stream Classification and Routing
//!
//! Maps container stream indices to stream kinds and output channels. The
//! catalog is rebuilt wholesale on open and mutated afterwards only by the
//! producer thread (stream renames for runtime track switching).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::channel::OutputChannel;
use crate::config::EngineConfig;
use crate::packet::{MediaType, StreamKind};
use crate::source::StreamDescriptor;

/// Classify a stream from its codec identifier when the container did not
/// label the stream kind itself.
pub fn classify(codec: &str) -> StreamKind {
    match codec.to_ascii_lowercase().as_str() {
        "h264" | "avc" | "h265" | "hevc" | "vp8" | "vp9" | "av1" | "mpeg2" | "mpeg4" | "vc1" => {
            StreamKind::Video
        }
        "aac" | "ac3" | "eac3" | "dts" | "truehd" | "mp3" | "mp2" | "flac" | "vorbis" | "opus"
        | "pcm" => StreamKind::Audio,
        "srt" | "subrip" | "ass" | "ssa" | "pgs" | "dvbsub" | "vobsub" | "webvtt" => {
            StreamKind::Subtitle
        }
        _ => StreamKind::Unknown,
    }
}

struct CatalogEntry {
    kind: StreamKind,
    channel: Arc<OutputChannel>,
}

#[derive(Default)]
pub struct StreamCatalog {
    entries: HashMap<u32, CatalogEntry>,
}

impl StreamCatalog {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Build a fresh catalog from the container's stream list, creating one
    /// output channel per deliverable stream. Unknown streams get no
    /// channel; their packets are discarded by the engine.
    pub fn build(descriptors: &[StreamDescriptor], config: &EngineConfig) -> Self {
        let mut catalog = Self::new();
        for desc in descriptors {
            let kind = match desc.media_type.kind {
                StreamKind::Unknown => classify(&desc.media_type.codec),
                labeled => labeled,
            };
            if kind == StreamKind::Unknown {
                debug!(
                    stream = desc.index,
                    codec = %desc.media_type.codec,
                    "unsupported stream, no channel created"
                );
                continue;
            }

            // subtitle-like streams produce data sparsely and are exempt
            // from starvation checks
            let discontinuous = kind == StreamKind::Subtitle;
            let mut media_type = desc.media_type.clone();
            media_type.kind = kind;
            let channel = Arc::new(OutputChannel::new(
                desc.index,
                vec![media_type],
                discontinuous,
                config,
            ));
            catalog.entries.insert(
                desc.index,
                CatalogEntry {
                    kind,
                    channel,
                },
            );
        }
        catalog
    }

    pub fn kind(&self, stream_id: u32) -> Option<StreamKind> {
        self.entries.get(&stream_id).map(|e| e.kind)
    }

    pub fn channel(&self, stream_id: u32) -> Option<&Arc<OutputChannel>> {
        self.entries.get(&stream_id).map(|e| &e.channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Arc<OutputChannel>> {
        self.entries.values().map(|e| &e.channel)
    }

    /// The stream id currently delivering the given kind, if any.
    pub fn id_of_kind(&self, kind: StreamKind) -> Option<u32> {
        self.entries
            .iter()
            .find(|(_, e)| e.kind == kind && e.channel.is_connected())
            .map(|(id, _)| *id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-route an existing channel to a different container stream, e.g.
    /// when the user switches audio tracks. Delivery on the channel pauses
    /// for the duration of the swap and the downstream format is
    /// renegotiated before the next sample.
    ///
    /// Must run on, or be synchronized with, the producer thread.
    pub fn rename_output_channel(
        &mut self,
        old_id: u32,
        new_id: u32,
        new_format: MediaType,
    ) -> bool {
        let Some(entry) = self.entries.remove(&old_id) else {
            return false;
        };

        entry.channel.begin_flush();
        entry.channel.retag(new_id);
        entry.channel.renegotiate(new_format);
        entry.channel.end_flush();

        debug!(old = old_id, new = new_id, "output channel renamed");
        self.entries.insert(new_id, entry);
        true
    }
}
