use std::{
    fmt,
    io::{Read, Write},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream},
    time::Duration,
};

use log::warn;

/// TCP port the server listens on for the control channel.
pub const SLIM_PORT: u16 = 3483;

/// Largest control frame the server may send us.
pub const MAX_FRAME: usize = 4096;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_millis(100);
const SEND_RETRIES: u32 = 10;
const SEND_RETRY_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub enum ProtoError {
    ConnectionClosed,
    FrameTooLarge(usize),
    Io(std::io::Error),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::ConnectionClosed => write!(f, "Connection closed by server"),
            ProtoError::FrameTooLarge(n) => write!(f, "Control frame of {} bytes", n),
            ProtoError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ProtoError {}

impl From<std::io::Error> for ProtoError {
    fn from(e: std::io::Error) -> Self {
        ProtoError::Io(e)
    }
}

/// Stream format byte carried in `strm s` and `codc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Pcm,
    Mp3,
    Flac,
    Aac,
    Ogg,
    Alac,
    SelfDescribing,
    Unknown(u8),
}

impl From<u8> for Format {
    fn from(value: u8) -> Self {
        match value {
            b'p' => Format::Pcm,
            b'm' => Format::Mp3,
            b'f' => Format::Flac,
            b'a' => Format::Aac,
            b'o' => Format::Ogg,
            b'l' => Format::Alac,
            b'?' => Format::SelfDescribing,
            other => Format::Unknown(other),
        }
    }
}

impl Format {
    pub fn as_byte(&self) -> u8 {
        match self {
            Format::Pcm => b'p',
            Format::Mp3 => b'm',
            Format::Flac => b'f',
            Format::Aac => b'a',
            Format::Ogg => b'o',
            Format::Alac => b'l',
            Format::SelfDescribing => b'?',
            Format::Unknown(b) => *b,
        }
    }
}

/// The autostart digit from `strm s`. Values 2 and 3 ask us to hold the
/// stream in wait until a follow-up `cont` or `codc` arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoStart {
    None,
    Auto,
    Wait,
    AutoWait,
}

impl From<u8> for AutoStart {
    fn from(value: u8) -> Self {
        match value {
            b'1' => AutoStart::Auto,
            b'2' => AutoStart::Wait,
            b'3' => AutoStart::AutoWait,
            _ => AutoStart::None,
        }
    }
}

impl AutoStart {
    pub fn wants_cont(&self) -> bool {
        matches!(self, AutoStart::Wait | AutoStart::AutoWait)
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, AutoStart::Auto | AutoStart::AutoWait)
    }

    /// Promotion applied when `cont` arrives: 2 -> 0, 3 -> 1.
    pub fn promote(&self) -> AutoStart {
        match self {
            AutoStart::Wait => AutoStart::None,
            AutoStart::AutoWait => AutoStart::Auto,
            other => *other,
        }
    }
}

/// Reason reported in a DSCO frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCode {
    ConnectionClosed,
    LocalDisconnect,
    RemoteDisconnect,
    UnreachableHost,
    TimedOut,
}

impl DisconnectCode {
    pub fn as_byte(&self) -> u8 {
        match self {
            DisconnectCode::ConnectionClosed => 0,
            DisconnectCode::LocalDisconnect => 1,
            DisconnectCode::RemoteDisconnect => 2,
            DisconnectCode::UnreachableHost => 3,
            DisconnectCode::TimedOut => 4,
        }
    }
}

/// A control frame from the server, decoded once at the wire and matched
/// exhaustively by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Stream {
        autostart: AutoStart,
        format: Format,
        pcm_sample_size: u8,
        pcm_sample_rate: u8,
        pcm_channels: u8,
        pcm_endian: u8,
        threshold_kb: u8,
        output_threshold: u8,
        replay_gain: u32,
        server_port: u16,
        server_ip: Ipv4Addr,
        http_headers: String,
    },
    Status(u32),
    Flush,
    Stop,
    Pause(Duration),
    Unpause(u32),
    Skip(u32),
    Cont {
        meta_interval: u32,
        loop_count: u8,
    },
    Codc {
        format: Format,
        pcm_sample_size: u8,
        pcm_sample_rate: u8,
        pcm_channels: u8,
        pcm_endian: u8,
    },
    Enable {
        spdif: bool,
        dac: bool,
    },
    Gain {
        old_gain_left: u32,
        old_gain_right: u32,
        adjust: bool,
        preamp: u8,
    },
    Queryname,
    Setname(String),
    Serv {
        ip_address: Ipv4Addr,
        sync_group_id: Option<String>,
    },
    Ledc,
    Vers(String),
    Unrecognised(String),
}

impl ServerMessage {
    /// The `strm` subcommand byte recorded as `last_command`, when the
    /// message came from a `strm` frame.
    pub fn command_byte(&self) -> Option<u8> {
        match self {
            ServerMessage::Stream { .. } => Some(b's'),
            ServerMessage::Status(_) => Some(b't'),
            ServerMessage::Flush => Some(b'f'),
            ServerMessage::Stop => Some(b'q'),
            ServerMessage::Pause(_) => Some(b'p'),
            ServerMessage::Unpause(_) => Some(b'u'),
            ServerMessage::Skip(_) => Some(b'a'),
            _ => None,
        }
    }
}

/// A frame we send to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Helo {
        device_id: u8,
        revision: u8,
        mac: [u8; 6],
        wlan_channel_list: u16,
        bytes_received: u64,
        language: [u8; 2],
        capabilities: String,
    },
    Stat {
        event: [u8; 4],
        crlf: u8,
        buffer_size: u32,
        fullness: u32,
        bytes_received: u64,
        sig_strength: u16,
        jiffies: u32,
        output_buffer_size: u32,
        output_buffer_fullness: u32,
        elapsed_seconds: u32,
        voltage: u16,
        elapsed_milli_seconds: u32,
        server_timestamp: u32,
        error_code: u16,
    },
    Dsco(DisconnectCode),
    Resp(String),
    Meta(String),
    Name(String),
    Bye(u8),
}

impl ClientMessage {
    pub fn encode(&self) -> Vec<u8> {
        let (opcode, body): (&[u8; 4], Vec<u8>) = match self {
            ClientMessage::Helo {
                device_id,
                revision,
                mac,
                wlan_channel_list,
                bytes_received,
                language,
                capabilities,
            } => {
                let mut body = Vec::with_capacity(20 + capabilities.len());
                body.push(*device_id);
                body.push(*revision);
                body.extend_from_slice(mac);
                body.extend_from_slice(&wlan_channel_list.to_be_bytes());
                body.extend_from_slice(&((bytes_received >> 32) as u32).to_be_bytes());
                body.extend_from_slice(&(*bytes_received as u32).to_be_bytes());
                body.extend_from_slice(language);
                body.extend_from_slice(capabilities.as_bytes());
                (b"HELO", body)
            }
            ClientMessage::Stat {
                event,
                crlf,
                buffer_size,
                fullness,
                bytes_received,
                sig_strength,
                jiffies,
                output_buffer_size,
                output_buffer_fullness,
                elapsed_seconds,
                voltage,
                elapsed_milli_seconds,
                server_timestamp,
                error_code,
            } => {
                let mut body = Vec::with_capacity(53);
                body.extend_from_slice(event);
                body.push(*crlf);
                body.push(0); // mas_initialized
                body.push(0); // mas_mode
                body.extend_from_slice(&buffer_size.to_be_bytes());
                body.extend_from_slice(&fullness.to_be_bytes());
                body.extend_from_slice(&((bytes_received >> 32) as u32).to_be_bytes());
                body.extend_from_slice(&(*bytes_received as u32).to_be_bytes());
                body.extend_from_slice(&sig_strength.to_be_bytes());
                body.extend_from_slice(&jiffies.to_be_bytes());
                body.extend_from_slice(&output_buffer_size.to_be_bytes());
                body.extend_from_slice(&output_buffer_fullness.to_be_bytes());
                body.extend_from_slice(&elapsed_seconds.to_be_bytes());
                body.extend_from_slice(&voltage.to_be_bytes());
                body.extend_from_slice(&elapsed_milli_seconds.to_be_bytes());
                // Echoed verbatim, never reinterpreted
                body.extend_from_slice(&server_timestamp.to_be_bytes());
                body.extend_from_slice(&error_code.to_be_bytes());
                (b"STAT", body)
            }
            ClientMessage::Dsco(code) => (b"DSCO", vec![code.as_byte()]),
            ClientMessage::Resp(headers) => (b"RESP", headers.as_bytes().to_vec()),
            ClientMessage::Meta(meta) => (b"META", meta.as_bytes().to_vec()),
            ClientMessage::Name(name) => {
                let mut body = Vec::with_capacity(1 + name.len());
                body.push(0); // setd id 0: player name
                body.extend_from_slice(name.as_bytes());
                (b"SETD", body)
            }
            ClientMessage::Bye(upgrade) => (b"BYE!", vec![*upgrade]),
        };

        let mut frame = Vec::with_capacity(8 + body.len());
        frame.extend_from_slice(opcode);
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

/// Decode one received frame body (opcode plus payload, length prefix
/// already stripped).
pub fn decode_frame(buf: &[u8]) -> ServerMessage {
    if buf.len() < 4 {
        return ServerMessage::Unrecognised(String::from_utf8_lossy(buf).into_owned());
    }
    let opcode = &buf[..4];
    let body = &buf[4..];

    match opcode {
        b"strm" => decode_strm(body),
        b"cont" if body.len() >= 5 => ServerMessage::Cont {
            meta_interval: read_u32(body, 0),
            loop_count: body[4],
        },
        b"codc" if body.len() >= 5 => ServerMessage::Codc {
            format: body[0].into(),
            pcm_sample_size: body[1],
            pcm_sample_rate: body[2],
            pcm_channels: body[3],
            pcm_endian: body[4],
        },
        b"aude" if body.len() >= 2 => ServerMessage::Enable {
            spdif: body[0] != 0,
            dac: body[1] != 0,
        },
        b"audg" if body.len() >= 18 => ServerMessage::Gain {
            old_gain_left: read_u32(body, 0),
            old_gain_right: read_u32(body, 4),
            adjust: body[8] != 0,
            preamp: body[9],
        },
        b"setd" if !body.is_empty() => match (body[0], &body[1..]) {
            (0, []) => ServerMessage::Queryname,
            (0, name) => ServerMessage::Setname(String::from_utf8_lossy(name).into_owned()),
            (id, _) => ServerMessage::Unrecognised(format!("setd id {}", id)),
        },
        b"serv" if body.len() >= 4 => {
            let sync_group_id = if body.len() == 14 {
                Some(String::from_utf8_lossy(&body[4..14]).into_owned())
            } else {
                None
            };
            ServerMessage::Serv {
                ip_address: Ipv4Addr::from(read_u32(body, 0)),
                sync_group_id,
            }
        }
        b"ledc" => ServerMessage::Ledc,
        b"vers" => ServerMessage::Vers(
            String::from_utf8_lossy(body)
                .trim_end_matches('\0')
                .to_owned(),
        ),
        _ => ServerMessage::Unrecognised(String::from_utf8_lossy(opcode).into_owned()),
    }
}

fn decode_strm(body: &[u8]) -> ServerMessage {
    if body.len() < 24 {
        return ServerMessage::Unrecognised("strm".to_owned());
    }

    let replay_gain = read_u32(body, 14);
    match body[0] {
        b't' => ServerMessage::Status(replay_gain),
        b'f' => ServerMessage::Flush,
        b'q' => ServerMessage::Stop,
        b'p' => ServerMessage::Pause(Duration::from_millis(replay_gain as u64)),
        b'u' => ServerMessage::Unpause(replay_gain),
        b'a' => ServerMessage::Skip(replay_gain),
        b's' => ServerMessage::Stream {
            autostart: body[1].into(),
            format: body[2].into(),
            pcm_sample_size: body[3],
            pcm_sample_rate: body[4],
            pcm_channels: body[5],
            pcm_endian: body[6],
            threshold_kb: body[7],
            output_threshold: body[12],
            replay_gain,
            server_port: read_u16(body, 18),
            server_ip: Ipv4Addr::from(read_u32(body, 20)),
            http_headers: String::from_utf8_lossy(&body[24..]).into_owned(),
        },
        cmd => ServerMessage::Unrecognised(format!("strm {}", cmd as char)),
    }
}

/// A server we know how to reach: control port plus the CLI port and
/// version learnt from discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub cli_port: u16,
    pub version: Option<String>,
}

impl Server {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Server {
            ip,
            port,
            cli_port: 9090,
            version: None,
        }
    }

    pub fn socket(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }

    /// Connect the control channel, returning framed halves for the
    /// receive pump and the writer thread.
    pub fn connect(&self) -> Result<(FramedReader, FramedWriter), ProtoError> {
        let sock = TcpStream::connect_timeout(&SocketAddr::V4(self.socket()), CONNECT_TIMEOUT)?;
        sock.set_nodelay(true).ok();
        sock.set_read_timeout(Some(READ_TIMEOUT))?;
        let writer = sock.try_clone()?;
        Ok((FramedReader::new(sock), FramedWriter::new(writer)))
    }
}

impl From<SocketAddrV4> for Server {
    fn from(sock: SocketAddrV4) -> Self {
        Server::new(*sock.ip(), sock.port())
    }
}

/// Validate the 2-byte length prefix of an incoming frame.
pub fn frame_len(hdr: [u8; 2]) -> Result<usize, ProtoError> {
    let len = u16::from_be_bytes(hdr) as usize;
    if len > MAX_FRAME {
        Err(ProtoError::FrameTooLarge(len))
    } else {
        Ok(len)
    }
}

#[derive(Clone, Copy)]
enum ReadPhase {
    Length,
    Body(usize),
}

/// Two-phase framed reader. Reads survive the socket read timeout with
/// partial state intact so the caller can interleave status ticks.
pub struct FramedReader {
    sock: TcpStream,
    phase: ReadPhase,
    buf: Vec<u8>,
}

impl FramedReader {
    fn new(sock: TcpStream) -> Self {
        FramedReader {
            sock,
            phase: ReadPhase::Length,
            buf: Vec::with_capacity(MAX_FRAME),
        }
    }

    /// Read one frame. `Ok(None)` means the read timed out with no
    /// complete frame available.
    pub fn framed_read(&mut self) -> Result<Option<ServerMessage>, ProtoError> {
        loop {
            let want = match self.phase {
                ReadPhase::Length => 2,
                ReadPhase::Body(expect) => expect,
            };

            while self.buf.len() < want {
                let mut chunk = [0u8; MAX_FRAME];
                let room = want - self.buf.len();
                match self.sock.read(&mut chunk[..room]) {
                    Ok(0) => return Err(ProtoError::ConnectionClosed),
                    Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        return Ok(None);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            match self.phase {
                ReadPhase::Length => {
                    let expect = frame_len([self.buf[0], self.buf[1]])?;
                    self.buf.clear();
                    self.phase = ReadPhase::Body(expect);
                }
                ReadPhase::Body(_) => {
                    let msg = decode_frame(&self.buf);
                    self.buf.clear();
                    self.phase = ReadPhase::Length;
                    return Ok(Some(msg));
                }
            }
        }
    }
}

pub struct FramedWriter {
    sock: TcpStream,
}

impl FramedWriter {
    fn new(sock: TcpStream) -> Self {
        FramedWriter { sock }
    }

    pub fn framed_write(&mut self, msg: &ClientMessage) -> Result<(), ProtoError> {
        let frame = msg.encode();
        let mut sent = 0;
        let mut retries = 0;
        while sent < frame.len() {
            match self.sock.write(&frame[sent..]) {
                Ok(0) => return Err(ProtoError::ConnectionClosed),
                Ok(n) => {
                    sent += n;
                    retries = 0;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    retries += 1;
                    if retries > SEND_RETRIES {
                        warn!("Dropping {:?} frame, send would block", &frame[..4]);
                        return Ok(());
                    }
                    std::thread::sleep(SEND_RETRY_DELAY);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
