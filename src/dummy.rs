use std::net::Ipv4Addr;

use log::{debug, info};

use crate::{
    backend::{Backend, TrackMetadata},
    proto::Format,
    state::{DecodeState, OutputState, PlayerHandles, RenderState, StreamState},
};

/// A backend with no audio hardware behind it. The pipeline is simulated
/// by walking the shared status structs through the transitions a real
/// stream reader, decoder and renderer would perform, which makes the
/// binary usable as a ghost player against a live server.
pub struct DummyBackend {
    handles: PlayerHandles,
    connected: bool,
}

impl DummyBackend {
    pub fn new(handles: PlayerHandles) -> Self {
        DummyBackend {
            handles,
            connected: false,
        }
    }
}

impl Backend for DummyBackend {
    fn stream_connect(
        &mut self,
        ip: Ipv4Addr,
        port: u16,
        http_headers: &str,
        threshold: usize,
        continue_on_error: bool,
    ) -> anyhow::Result<()> {
        info!("Simulated stream connect to {}:{}", ip, port);
        debug!("Request headers: {:?}", http_headers);
        self.connected = true;
        if let Ok(mut stream) = self.handles.stream.lock() {
            // Pretend the response and a first chunk arrived at once
            stream.bytes = threshold as u64;
            stream.threshold = threshold;
            stream.header = Some("HTTP/1.0 200 OK\r\nContent-Type: audio/mpeg\r\n\r\n".to_owned());
            stream.state = if continue_on_error {
                StreamState::StreamingWait
            } else {
                StreamState::StreamingHttp
            };
        }
        Ok(())
    }

    fn stream_disconnect(&mut self) -> bool {
        let was_connected = self.connected;
        self.connected = false;
        if let Ok(mut stream) = self.handles.stream.lock() {
            stream.state = StreamState::Stopped;
        }
        self.handles.streambuf.flush();
        was_connected
    }

    fn decode_flush(&mut self) {
        if let Ok(mut decode) = self.handles.decode.lock() {
            decode.state = DecodeState::Stopped;
        }
    }

    fn output_flush(&mut self) {
        if let Ok(mut output) = self.handles.output.lock() {
            output.state = OutputState::Stopped;
            output.track_started = false;
            output.completed = false;
            output.ms_played = 0;
        }
        if let Ok(mut render) = self.handles.render.lock() {
            render.state = RenderState::Stopped;
        }
        self.handles.outputbuf.flush();
    }

    fn codec_open(
        &mut self,
        format: Format,
        sample_size: u8,
        sample_rate: u32,
        channels: u8,
        big_endian: bool,
    ) -> anyhow::Result<()> {
        info!(
            "Simulated decoder open: {:?} {}bit {}Hz {}ch {}",
            format,
            sample_size,
            sample_rate,
            channels,
            if big_endian { "be" } else { "le" }
        );
        if let Ok(mut decode) = self.handles.decode.lock() {
            decode.state = DecodeState::Ready;
        }
        Ok(())
    }

    fn output_start(&mut self) -> anyhow::Result<()> {
        if let Ok(mut output) = self.handles.output.lock() {
            output.state = OutputState::Running;
            output.track_started = true;
        }
        Ok(())
    }

    fn metadata(&mut self, offset: u32) -> TrackMetadata {
        debug!("Metadata request at offset {}", offset);
        TrackMetadata {
            title: format!("Track {}", offset + 1),
            artist: "Unknown Artist".to_owned(),
            ..TrackMetadata::default()
        }
    }

    fn set_icy(&mut self, meta: &TrackMetadata, force: bool) {
        debug!("ICY update ({}): {}", force, meta.icy_title());
        if let Ok(mut stream) = self.handles.stream.lock() {
            stream.meta_send = Some(meta.icy_title());
        }
    }
}
