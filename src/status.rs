use std::time::Instant;

use crate::proto::ClientMessage;

/// The STAT event family. One code per 4-byte event tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// STMs
    TrackStarted,
    /// STMt
    Timer,
    /// STMl
    BufferThreshold,
    /// STMd
    DecoderReady,
    /// STMu
    Underrun,
    /// STMo
    Overrun,
    /// STMn
    NotSupported,
    /// STMf
    Flushed,
    /// STMp
    Pause,
    /// STMr
    Resume,
    /// STMc
    Connect,
}

impl StatusCode {
    pub fn event(&self) -> [u8; 4] {
        match self {
            StatusCode::TrackStarted => *b"STMs",
            StatusCode::Timer => *b"STMt",
            StatusCode::BufferThreshold => *b"STMl",
            StatusCode::DecoderReady => *b"STMd",
            StatusCode::Underrun => *b"STMu",
            StatusCode::Overrun => *b"STMo",
            StatusCode::NotSupported => *b"STMn",
            StatusCode::Flushed => *b"STMf",
            StatusCode::Pause => *b"STMp",
            StatusCode::Resume => *b"STMr",
            StatusCode::Connect => *b"STMc",
        }
    }
}

/// Snapshot of player state published to the server in every STAT frame.
#[derive(Debug, Clone)]
pub struct StatusData {
    crlf: u8,
    buffer_size: u32,
    fullness: u32,
    bytes_received: u64,
    output_buffer_size: u32,
    output_buffer_fullness: u32,
    elapsed_seconds: u32,
    elapsed_milli_seconds: u32,
    timestamp: u32,
    start: Instant,
}

impl Default for StatusData {
    fn default() -> Self {
        StatusData {
            crlf: 0,
            buffer_size: 0,
            fullness: 0,
            bytes_received: 0,
            output_buffer_size: 0,
            output_buffer_fullness: 0,
            elapsed_seconds: 0,
            elapsed_milli_seconds: 0,
            timestamp: 0,
            start: Instant::now(),
        }
    }
}

impl StatusData {
    pub fn add_crlf(&mut self, n: u8) {
        self.crlf = self.crlf.wrapping_add(n);
    }

    pub fn set_buffer_size(&mut self, size: u32) {
        self.buffer_size = size;
    }

    pub fn set_fullness(&mut self, fullness: u32) {
        self.fullness = fullness;
    }

    pub fn set_bytes_received(&mut self, bytes: u64) {
        self.bytes_received = bytes;
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn set_output_buffer_size(&mut self, size: u32) {
        self.output_buffer_size = size;
    }

    pub fn set_output_buffer_fullness(&mut self, fullness: u32) {
        self.output_buffer_fullness = fullness;
    }

    pub fn set_elapsed_seconds(&mut self, secs: u32) {
        self.elapsed_seconds = secs;
    }

    pub fn set_elapsed_milli_seconds(&mut self, ms: u32) {
        self.elapsed_milli_seconds = ms;
    }

    /// Server timestamp echoed verbatim in the next STAT.
    pub fn set_timestamp(&mut self, ts: u32) {
        self.timestamp = ts;
    }

    /// Reset the per-stream counters at the start of a new stream.
    pub fn reset_stream(&mut self) {
        self.crlf = 0;
        self.buffer_size = 0;
        self.fullness = 0;
        self.bytes_received = 0;
        self.elapsed_seconds = 0;
        self.elapsed_milli_seconds = 0;
    }

    /// Milliseconds since player start, wrapping as the protocol expects.
    pub fn jiffies(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    pub fn make_status_message(&self, code: StatusCode) -> ClientMessage {
        ClientMessage::Stat {
            event: code.event(),
            crlf: self.crlf,
            buffer_size: self.buffer_size,
            fullness: self.fullness,
            bytes_received: self.bytes_received,
            sig_strength: 0,
            jiffies: self.jiffies(),
            output_buffer_size: self.output_buffer_size,
            output_buffer_fullness: self.output_buffer_fullness,
            elapsed_seconds: self.elapsed_seconds,
            voltage: 0,
            elapsed_milli_seconds: self.elapsed_milli_seconds,
            server_timestamp: self.timestamp,
            error_code: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_message_carries_counters() {
        let mut status = StatusData::default();
        status.add_crlf(2);
        status.set_buffer_size(2048);
        status.set_fullness(100);
        status.set_bytes_received(1 << 33);
        status.set_timestamp(42);

        match status.make_status_message(StatusCode::Timer) {
            ClientMessage::Stat {
                event,
                crlf,
                buffer_size,
                fullness,
                bytes_received,
                server_timestamp,
                ..
            } => {
                assert_eq!(&event, b"STMt");
                assert_eq!(crlf, 2);
                assert_eq!(buffer_size, 2048);
                assert_eq!(fullness, 100);
                assert_eq!(bytes_received, 1 << 33);
                assert_eq!(server_timestamp, 42);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn reset_stream_clears_counters_not_timestamp() {
        let mut status = StatusData::default();
        status.add_crlf(1);
        status.set_bytes_received(9999);
        status.set_timestamp(7);
        status.reset_stream();

        match status.make_status_message(StatusCode::Flushed) {
            ClientMessage::Stat {
                crlf,
                bytes_received,
                server_timestamp,
                ..
            } => {
                assert_eq!(crlf, 0);
                assert_eq!(bytes_received, 0);
                assert_eq!(server_timestamp, 7);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
