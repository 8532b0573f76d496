use std::sync::{Arc, Mutex};

use crate::{buffer::SlimBuffer, proto::DisconnectCode};

/// Stream reader state. Owned by the stream side; the controller only
/// performs the Disconnect -> Stopped transition when reporting DSCO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    StreamingWait,
    StreamingBuffering,
    StreamingHttp,
    StreamingFile,
    Disconnect(DisconnectCode),
}

impl StreamState {
    /// The HTTP connection still holds the remote end open.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            StreamState::StreamingWait
                | StreamState::StreamingBuffering
                | StreamState::StreamingHttp
                | StreamState::StreamingFile
        )
    }

    /// Data is flowing past the buffering stage.
    pub fn is_delivering(&self) -> bool {
        matches!(self, StreamState::StreamingHttp | StreamState::StreamingFile)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Stopped,
    Ready,
    Running,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Stopped,
    Waiting,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    Stopped,
    Playing,
}

/// Shared with the stream reader thread.
#[derive(Debug)]
pub struct StreamStatus {
    pub state: StreamState,
    pub bytes: u64,
    pub threshold: usize,
    pub meta_interval: u32,
    /// HTTP response headers pending a RESP frame.
    pub header: Option<String>,
    /// ICY metadata pending a META frame.
    pub meta_send: Option<String>,
}

impl Default for StreamStatus {
    fn default() -> Self {
        StreamStatus {
            state: StreamState::Stopped,
            bytes: 0,
            threshold: 0,
            meta_interval: 0,
            header: None,
            meta_send: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamSnapshot {
    pub state: StreamState,
    pub bytes: u64,
}

impl StreamStatus {
    /// Sample for the status ticker. Takes the one-shot items: a pending
    /// disconnect becomes Stopped, headers and metadata are handed over
    /// exactly once.
    pub fn sample(
        &mut self,
    ) -> (StreamSnapshot, Option<DisconnectCode>, Option<String>, Option<String>) {
        let disconnect = if let StreamState::Disconnect(code) = self.state {
            self.state = StreamState::Stopped;
            Some(code)
        } else {
            None
        };

        let header = if self.state.is_open() {
            self.header.take()
        } else {
            None
        };

        let meta = self.meta_send.take();

        (
            StreamSnapshot {
                state: self.state,
                bytes: self.bytes,
            },
            disconnect,
            header,
            meta,
        )
    }
}

/// Shared with the output/renderer thread.
#[derive(Debug)]
pub struct OutputStatus {
    pub state: OutputState,
    pub start_at: u32,
    /// Set by the output side when the first sample of a track is consumed.
    pub track_started: bool,
    /// Set when the output side has drained everything it was given.
    pub completed: bool,
    pub remote: bool,
    pub duration: u32,
    pub ms_played: u32,
    pub index: u32,
    pub flow: bool,
}

impl Default for OutputStatus {
    fn default() -> Self {
        OutputStatus {
            state: OutputState::Stopped,
            start_at: 0,
            track_started: false,
            completed: false,
            remote: false,
            duration: 0,
            ms_played: 0,
            index: 0,
            flow: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OutputSnapshot {
    pub state: OutputState,
    pub track_started: bool,
    pub completed: bool,
    pub remote: bool,
    pub duration: u32,
    pub ms_played: u32,
    pub flow: bool,
}

impl OutputStatus {
    /// Sample for the status ticker, consuming the track_started one-shot.
    pub fn sample(&mut self) -> OutputSnapshot {
        let track_started = std::mem::take(&mut self.track_started);
        OutputSnapshot {
            state: self.state,
            track_started,
            completed: self.completed,
            remote: self.remote,
            duration: self.duration,
            ms_played: self.ms_played,
            flow: self.flow,
        }
    }
}

#[derive(Debug, Default)]
pub struct DecodeStatus {
    pub state: DecodeState,
}

impl Default for DecodeState {
    fn default() -> Self {
        DecodeState::Stopped
    }
}

#[derive(Debug)]
pub struct RenderStatus {
    pub state: RenderState,
    /// Index of the track currently being rendered, 0 before anything has.
    pub index: u32,
}

impl Default for RenderStatus {
    fn default() -> Self {
        RenderStatus {
            state: RenderState::Stopped,
            index: 0,
        }
    }
}

/// The shared sub-state handles for one virtual player: cloned into the
/// controller and into whichever backend drives the pipeline.
#[derive(Clone)]
pub struct PlayerHandles {
    pub stream: Arc<Mutex<StreamStatus>>,
    pub output: Arc<Mutex<OutputStatus>>,
    pub decode: Arc<Mutex<DecodeStatus>>,
    pub render: Arc<Mutex<RenderStatus>>,
    pub streambuf: Arc<SlimBuffer>,
    pub outputbuf: Arc<SlimBuffer>,
}

impl PlayerHandles {
    pub fn new(streambuf_size: usize, outputbuf_size: usize) -> Self {
        PlayerHandles {
            stream: Arc::new(Mutex::new(StreamStatus::default())),
            output: Arc::new(Mutex::new(OutputStatus::default())),
            decode: Arc::new(Mutex::new(DecodeStatus::default())),
            render: Arc::new(Mutex::new(RenderStatus::default())),
            streambuf: Arc::new(SlimBuffer::new(streambuf_size)),
            outputbuf: Arc::new(SlimBuffer::new(outputbuf_size)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_converts_disconnect_to_stopped() {
        let mut stream = StreamStatus::default();
        stream.state = StreamState::Disconnect(DisconnectCode::RemoteDisconnect);
        let (snap, disconnect, _, _) = stream.sample();
        assert_eq!(disconnect, Some(DisconnectCode::RemoteDisconnect));
        assert_eq!(snap.state, StreamState::Stopped);
        // Second sample reports nothing
        let (_, disconnect, _, _) = stream.sample();
        assert_eq!(disconnect, None);
    }

    #[test]
    fn headers_hand_over_once_and_only_while_open() {
        let mut stream = StreamStatus::default();
        stream.header = Some("HTTP/1.0 200 OK\r\n\r\n".to_owned());

        // Stopped stream keeps its headers
        let (_, _, header, _) = stream.sample();
        assert!(header.is_none());

        stream.state = StreamState::StreamingHttp;
        let (_, _, header, _) = stream.sample();
        assert_eq!(header.as_deref(), Some("HTTP/1.0 200 OK\r\n\r\n"));
        let (_, _, header, _) = stream.sample();
        assert!(header.is_none());
    }

    #[test]
    fn track_started_is_one_shot() {
        let mut output = OutputStatus::default();
        output.track_started = true;
        assert!(output.sample().track_started);
        assert!(!output.sample().track_started);
    }
}
