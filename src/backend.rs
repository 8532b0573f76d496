use std::net::Ipv4Addr;

use crate::proto::Format;

/// Per-track metadata pulled from the current playlist position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    /// Duration in ms, 0 when unknown.
    pub duration: u32,
    pub remote: bool,
}

impl TrackMetadata {
    /// ICY-style single line for the output side.
    pub fn icy_title(&self) -> String {
        if self.artist.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.artist, self.title)
        }
    }
}

/// The seam between the controller and its collaborators: the HTTP stream
/// reader, the decoder and the output renderer all live behind this trait.
/// The controller drives lifecycles through it and observes results via
/// the shared status handles.
pub trait Backend: Send {
    /// Open the HTTP stream the server pointed us at. `continue_on_error`
    /// is set when autostart 2/3 promises a follow-up `cont`.
    fn stream_connect(
        &mut self,
        ip: Ipv4Addr,
        port: u16,
        http_headers: &str,
        threshold: usize,
        continue_on_error: bool,
    ) -> anyhow::Result<()>;

    /// Idempotent; true when a connection was actually closed.
    fn stream_disconnect(&mut self) -> bool;

    fn decode_flush(&mut self);

    fn output_flush(&mut self);

    fn codec_open(
        &mut self,
        format: Format,
        sample_size: u8,
        sample_rate: u32,
        channels: u8,
        big_endian: bool,
    ) -> anyhow::Result<()>;

    fn output_start(&mut self) -> anyhow::Result<()>;

    /// Metadata for the track `offset` positions ahead of the one
    /// currently rendering.
    fn metadata(&mut self, offset: u32) -> TrackMetadata;

    fn set_icy(&mut self, meta: &TrackMetadata, force: bool);
}
