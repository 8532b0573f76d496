use std::{
    net::Ipv4Addr,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crossbeam::{
    atomic::AtomicCell,
    channel::{unbounded, Receiver, Sender},
};
use log::{debug, error, info, warn};

use crate::{
    backend::Backend,
    config::{Config, NAME_LEN},
    discover,
    message::BridgeCmd,
    negotiate::{self, StreamFormat},
    proto::{
        AutoStart, ClientMessage, Format, FramedReader, Server, ServerMessage, SLIM_PORT,
    },
    state::{DecodeState, OutputState, PlayerHandles, RenderState, StreamState},
    status::{StatusCode, StatusData},
};

/// Longest HTTP request header a `strm s` may carry.
pub const MAX_HEADER: usize = 4096;

/// Remote sources get the next-track request this close to the end, to
/// keep their idle timers from firing while we drain.
const STREAM_DELAY_MS: u32 = 3000;

const ICY_UPDATE_TIME: Duration = Duration::from_millis(5000);
const WATCHDOG: Duration = Duration::from_secs(35);
const RETRY_SLEEP: Duration = Duration::from_secs(5);
const RETRIES_BEFORE_REDISCOVERY: u32 = 5;
const STAT_PERIOD: Duration = Duration::from_secs(1);

const BASE_CAPS: &str =
    "Model=squeezelite,ModelName=SqueezeLite,AccuratePlayPoints=0,HasDigitalOut=1";

/// One-shot per-track latches. `can_stmdu` arms once the output side has
/// consumed the first sample, which is what keeps STMd/STMu/STMo behind
/// STMs even for very short tracks.
#[derive(Debug, Default)]
struct TrackLatches {
    can_stmdu: bool,
    sent_stms: bool,
    sent_stml: bool,
    sent_stmd: bool,
    sent_stmu: bool,
    sent_stmo: bool,
}

impl TrackLatches {
    fn reset(&mut self) {
        *self = TrackLatches::default();
    }
}

enum SessionEnd {
    Shutdown,
    Lost,
    NewServer(Ipv4Addr),
}

fn watchdog_expired(last_frame: Instant) -> bool {
    last_frame.elapsed() > WATCHDOG
}

/// The per-player protocol task. Owns the control socket, the protocol
/// bookkeeping and the status ticker; collaborators are reached through
/// the backend seam and the bridge channel.
pub struct Controller<B: Backend> {
    cfg: Config,
    backend: B,
    bridge: Sender<BridgeCmd>,
    slim_tx: Sender<ClientMessage>,
    handles: PlayerHandles,
    status: StatusData,
    server: Server,
    name: String,
    new_server: Option<Ipv4Addr>,
    new_server_cap: Option<String>,
    var_cap: String,
    last_command: u8,
    autostart: AutoStart,
    latches: TrackLatches,
    last_stat: Instant,
    last_icy: Instant,
    wake: Arc<AtomicCell<bool>>,
    running: Arc<AtomicCell<bool>>,
    on: bool,
}

impl<B: Backend> Controller<B> {
    pub fn new(
        cfg: Config,
        backend: B,
        bridge: Sender<BridgeCmd>,
        slim_tx: Sender<ClientMessage>,
        handles: PlayerHandles,
        running: Arc<AtomicCell<bool>>,
    ) -> Self {
        let server = cfg
            .server
            .map(Server::from)
            .unwrap_or_else(|| Server::new(Ipv4Addr::UNSPECIFIED, SLIM_PORT));
        let name = cfg.name.clone();
        Controller {
            cfg,
            backend,
            bridge,
            slim_tx,
            handles,
            status: StatusData::default(),
            server,
            name,
            new_server: None,
            new_server_cap: None,
            var_cap: String::new(),
            last_command: 0,
            autostart: AutoStart::None,
            latches: TrackLatches::default(),
            last_stat: Instant::now(),
            last_icy: Instant::now(),
            wake: Arc::new(AtomicCell::new(false)),
            running,
            on: false,
        }
    }

    /// Signal handle that unblocks the receive pump for an early tick.
    pub fn wake_handle(&self) -> Arc<AtomicCell<bool>> {
        self.wake.clone()
    }

    /// Discovery, connection and reconnection until `running` clears.
    pub fn run(mut self, slim_rx: Receiver<ClientMessage>) {
        let mut reconnect = false;
        let mut failures = 0u32;

        while self.running.load() {
            if self.server.ip.is_unspecified() {
                match discover::discover(None, &self.running) {
                    Ok(Some(server)) => {
                        self.server = server;
                        self.bridge.send(BridgeCmd::SetServer(self.server.ip)).ok();
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("Discovery failed: {}", e);
                        thread::sleep(RETRY_SLEEP);
                        continue;
                    }
                }
            }

            info!("Connecting to server: {}", self.server.socket());
            match self.server.connect() {
                Ok((mut rx, mut tx)) => {
                    failures = 0;
                    let slim_rx_r = slim_rx.clone();
                    let writer = thread::spawn(move || {
                        while let Ok(msg) = slim_rx_r.recv() {
                            if let ClientMessage::Bye(n) = msg {
                                if n == 1 {
                                    break;
                                }
                            }
                            if tx.framed_write(&msg).is_err() {
                                break;
                            }
                        }
                    });

                    let end = self.session(&mut rx, reconnect);

                    self.slim_tx.send(ClientMessage::Bye(1)).ok();
                    writer.join().ok();

                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::NewServer(ip) => {
                            info!("Migrating to server at {}", ip);
                            self.server = Server::new(ip, SLIM_PORT);
                            reconnect = false;
                        }
                        SessionEnd::Lost => reconnect = true,
                    }
                }
                Err(e) => {
                    error!("Error connecting to server: {}", e);
                    failures += 1;
                    thread::sleep(RETRY_SLEEP);
                    if failures >= RETRIES_BEFORE_REDISCOVERY && self.cfg.server.is_none() {
                        info!("Server gone quiet, re-running discovery");
                        self.server.ip = Ipv4Addr::UNSPECIFIED;
                        failures = 0;
                    }
                }
            }
        }
        info!("Controller for {} shutting down", self.name);
    }

    /// One connected session: HELO, then the receive pump multiplexed
    /// with the status ticker and the silence watchdog.
    fn session(&mut self, rx: &mut FramedReader, reconnect: bool) -> SessionEnd {
        let helo = self.helo(reconnect);
        self.slim_tx.send(helo).ok();

        let mut last_frame = Instant::now();
        loop {
            if !self.running.load() {
                return SessionEnd::Shutdown;
            }
            if let Some(ip) = self.new_server.take() {
                return SessionEnd::NewServer(ip);
            }

            match rx.framed_read() {
                Ok(Some(msg)) => {
                    last_frame = Instant::now();
                    self.handle(msg);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Control connection lost: {}", e);
                    return SessionEnd::Lost;
                }
            }

            self.wake.take();
            self.tick();

            if watchdog_expired(last_frame) {
                warn!("No server frames for {:?}, reconnecting", WATCHDOG);
                return SessionEnd::Lost;
            }
        }
    }

    fn helo(&mut self, reconnect: bool) -> ClientMessage {
        self.var_cap = self.new_server_cap.take().unwrap_or_default();
        let capabilities = format!(
            "{},MaxSampleRate={},{}{}",
            BASE_CAPS, self.cfg.sample_rate, self.cfg.codecs, self.var_cap
        );
        ClientMessage::Helo {
            device_id: 12,
            revision: 0,
            mac: self.cfg.mac,
            wlan_channel_list: if reconnect { 0x4000 } else { 0 },
            bytes_received: self.status.bytes_received(),
            language: *b"en",
            capabilities,
        }
    }

    fn send_status(&mut self, code: StatusCode) {
        self.status
            .set_buffer_size(self.handles.streambuf.size() as u32);
        self.status
            .set_fullness(self.handles.streambuf.used() as u32);
        self.status
            .set_output_buffer_size(self.handles.outputbuf.size() as u32);
        self.status
            .set_output_buffer_fullness(self.handles.outputbuf.used() as u32);
        self.slim_tx
            .send(self.status.make_status_message(code))
            .ok();
    }

    fn handle(&mut self, msg: ServerMessage) {
        let command = msg.command_byte();
        match msg {
            ServerMessage::Stream {
                autostart,
                format,
                pcm_sample_size,
                pcm_sample_rate,
                pcm_channels,
                pcm_endian,
                threshold_kb,
                server_port,
                server_ip,
                http_headers,
                ..
            } => {
                let fmt = StreamFormat {
                    format,
                    pcm_sample_size,
                    pcm_sample_rate,
                    pcm_channels,
                    pcm_endian,
                };
                self.strm_start(
                    autostart,
                    fmt,
                    threshold_kb,
                    server_port,
                    server_ip,
                    http_headers,
                );
            }

            ServerMessage::Status(ts) => {
                self.status.set_timestamp(ts);
                self.send_status(StatusCode::Timer);
            }

            ServerMessage::Flush => {
                info!("Flushing");
                self.flush_all();
                self.send_status(StatusCode::Flushed);
                self.handles.streambuf.flush();
            }

            ServerMessage::Stop => {
                info!("Stop playback received");
                self.flush_all();
                if self.last_command != b'q' {
                    self.bridge.send(BridgeCmd::Stop).ok();
                }
                self.send_status(StatusCode::Flushed);
                self.handles.streambuf.flush();
            }

            ServerMessage::Pause(interval) => {
                if interval.is_zero() {
                    info!("Pausing");
                    if let Ok(mut output) = self.handles.output.lock() {
                        output.state = OutputState::Waiting;
                    }
                    self.bridge.send(BridgeCmd::Pause).ok();
                    self.send_status(StatusCode::Pause);
                } else {
                    info!("Delayed pause requested ({:?}), not honoured", interval);
                }
            }

            ServerMessage::Unpause(at) => {
                info!("Resuming at jiffie {}", at);
                if let Ok(mut output) = self.handles.output.lock() {
                    output.state = OutputState::Running;
                    output.start_at = at;
                }
                self.bridge.send(BridgeCmd::Unpause).ok();
                self.send_status(StatusCode::Resume);
            }

            ServerMessage::Skip(ms) => {
                info!("Skip ahead of {} ms ignored", ms);
            }

            ServerMessage::Cont {
                meta_interval,
                loop_count,
            } => {
                debug!("cont: meta interval {}, loop {}", meta_interval, loop_count);
                if self.autostart.wants_cont() {
                    self.autostart = self.autostart.promote();
                    if let Ok(mut stream) = self.handles.stream.lock() {
                        if stream.state == StreamState::StreamingWait {
                            stream.state = StreamState::StreamingBuffering;
                        }
                        stream.meta_interval = meta_interval;
                    }
                }
                self.wake.store(true);
            }

            ServerMessage::Codc {
                format,
                pcm_sample_size,
                pcm_sample_rate,
                pcm_channels,
                pcm_endian,
            } => {
                let fmt = StreamFormat {
                    format,
                    pcm_sample_size,
                    pcm_sample_rate,
                    pcm_channels,
                    pcm_endian,
                };
                if !negotiate::process_start(
                    &fmt,
                    &self.cfg,
                    &mut self.backend,
                    &self.bridge,
                    &self.handles,
                ) {
                    self.send_status(StatusCode::NotSupported);
                }
            }

            ServerMessage::Enable { spdif, .. } => {
                info!("Player {}", if spdif { "on" } else { "off" });
                self.on = spdif;
                self.bridge.send(BridgeCmd::OnOff(spdif)).ok();
            }

            ServerMessage::Gain {
                old_gain_left,
                adjust,
                ..
            } => {
                let gain = old_gain_left.wrapping_add(old_gain_left) / 2;
                if adjust {
                    let volume = (gain as f64 / 128.0).min(1.0);
                    info!("Setting volume to {:.2}", volume);
                    self.bridge.send(BridgeCmd::Volume(volume)).ok();
                }
            }

            ServerMessage::Queryname => {
                info!("Name query from server");
                self.slim_tx
                    .send(ClientMessage::Name(self.name.clone()))
                    .ok();
            }

            ServerMessage::Setname(new_name) => {
                let name: String = new_name.chars().take(NAME_LEN).collect();
                info!("Set name to {}", name);
                self.name = name.clone();
                self.slim_tx.send(ClientMessage::Name(name.clone())).ok();
                self.bridge.send(BridgeCmd::SetName(name)).ok();
            }

            ServerMessage::Serv {
                ip_address,
                sync_group_id,
            } => {
                info!("Switching to server at {}", ip_address);
                if let Some(id) = sync_group_id {
                    self.new_server_cap = Some(format!(",SyncgroupID={}", id));
                }
                self.new_server = Some(ip_address);
                self.bridge.send(BridgeCmd::SetServer(ip_address)).ok();
            }

            ServerMessage::Ledc => debug!("ledc"),

            ServerMessage::Vers(version) => info!("Server version: {}", version),

            ServerMessage::Unrecognised(opcode) => {
                warn!("Unrecognised opcode: {}", opcode);
            }
        }

        if let Some(cmd) = command {
            self.last_command = cmd;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn strm_start(
        &mut self,
        autostart: AutoStart,
        fmt: StreamFormat,
        threshold_kb: u8,
        server_port: u16,
        server_ip: Ipv4Addr,
        http_headers: String,
    ) {
        info!("Start stream command from server");
        debug!("\tFormat: {:?}", fmt.format);
        debug!("\tAutostart: {:?}", autostart);
        debug!("\tThreshold: {} KB", threshold_kb);

        if http_headers.len() >= MAX_HEADER {
            error!("Request header of {} bytes refused", http_headers.len());
            self.send_status(StatusCode::NotSupported);
            return;
        }

        self.latches.reset();
        self.autostart = autostart;
        self.status.reset_stream();
        self.status
            .add_crlf(http_headers.matches("\r\n").count() as u8);
        if let Ok(mut output) = self.handles.output.lock() {
            output.ms_played = 0;
            output.completed = false;
            output.track_started = false;
        }

        self.send_status(StatusCode::Flushed);

        let negotiated = match fmt.format {
            // The codec arrives in a follow-up codc
            Format::SelfDescribing if autostart.wants_cont() => true,
            Format::SelfDescribing => {
                error!("No stream format and no codc promised");
                false
            }
            _ => negotiate::process_start(
                &fmt,
                &self.cfg,
                &mut self.backend,
                &self.bridge,
                &self.handles,
            ),
        };

        if !negotiated {
            self.send_status(StatusCode::NotSupported);
            return;
        }

        // An unspecified address means stream from the control server
        let ip = if server_ip.is_unspecified() {
            self.server.ip
        } else {
            server_ip
        };
        let threshold = threshold_kb as usize * 1024;
        match self.backend.stream_connect(
            ip,
            server_port,
            &http_headers,
            threshold,
            autostart.wants_cont(),
        ) {
            Ok(()) => {
                if let Ok(mut stream) = self.handles.stream.lock() {
                    stream.threshold = threshold;
                }
                self.send_status(StatusCode::Connect);
            }
            Err(e) => {
                error!("Unable to open data stream: {}", e);
                self.send_status(StatusCode::NotSupported);
            }
        }
    }

    fn flush_all(&mut self) {
        self.backend.decode_flush();
        self.backend.output_flush();
        self.backend.stream_disconnect();
        if let Ok(mut output) = self.handles.output.lock() {
            output.ms_played = 0;
        }
        self.status.set_elapsed_milli_seconds(0);
        self.status.set_elapsed_seconds(0);
    }

    /// The status ticker. Samples each domain under its own lock, decides
    /// which messages to emit, then sends them in a fixed order with no
    /// lock held.
    fn tick(&mut self) {
        let (stream, dsco, resp, meta) = match self.handles.stream.lock() {
            Ok(mut s) => s.sample(),
            Err(_) => return,
        };
        self.status.set_bytes_received(stream.bytes);

        let out = match self.handles.output.lock() {
            Ok(mut o) => o.sample(),
            Err(_) => return,
        };
        self.status.set_elapsed_milli_seconds(out.ms_played);
        self.status.set_elapsed_seconds(out.ms_played / 1000);

        let dec = match self.handles.decode.lock() {
            Ok(d) => d.state,
            Err(_) => return,
        };
        let render = match self.handles.render.lock() {
            Ok(r) => r.state,
            Err(_) => return,
        };

        let mut stms = false;
        let mut stmt = false;
        let mut stml = false;
        let mut stmd = false;
        let mut stmu = false;
        let mut stmo = false;
        let mut stmn = false;

        if out.track_started && !self.latches.sent_stms {
            stms = true;
            self.latches.sent_stms = true;
            self.latches.can_stmdu = true;
        }

        // Output ran to completion without a single stream byte arriving
        if out.state == OutputState::Running && out.completed && stream.bytes == 0 {
            warn!("Stream never delivered data");
            stmn = true;
            self.latches.can_stmdu = true;
            if let Ok(mut output) = self.handles.output.lock() {
                output.state = OutputState::Stopped;
            }
            if let Ok(mut render) = self.handles.render.lock() {
                render.state = RenderState::Stopped;
            }
            if let Ok(mut decode) = self.handles.decode.lock() {
                decode.state = DecodeState::Stopped;
            }
        }

        if dec == DecodeState::Running && self.last_stat.elapsed() >= STAT_PERIOD {
            stmt = true;
            self.last_stat = Instant::now();
        }

        if dec == DecodeState::Ready && !self.latches.sent_stml && stream.state.is_delivering() {
            match self.autostart {
                AutoStart::None => {
                    if let Ok(mut decode) = self.handles.decode.lock() {
                        decode.state = DecodeState::Running;
                    }
                    stml = true;
                    self.latches.sent_stml = true;
                    self.bridge.send(BridgeCmd::Play).ok();
                }
                AutoStart::Auto => {
                    // The server will not wait for us, run immediately
                    if let Ok(mut decode) = self.handles.decode.lock() {
                        decode.state = DecodeState::Running;
                    }
                    if let Ok(mut output) = self.handles.output.lock() {
                        if output.state == OutputState::Stopped {
                            output.state = OutputState::Running;
                        }
                    }
                    self.latches.sent_stml = true;
                    self.bridge.send(BridgeCmd::Play).ok();
                }
                // Still waiting for cont
                AutoStart::Wait | AutoStart::AutoWait => {}
            }
        }

        match dec {
            DecodeState::Complete
                if !self.latches.sent_stmd
                    && self.latches.can_stmdu
                    && out.state != OutputState::Stopped =>
            {
                let drained_enough = out.flow
                    || !out.remote
                    || out.duration.saturating_sub(out.ms_played) < STREAM_DELAY_MS;
                if drained_enough {
                    stmd = true;
                    self.latches.sent_stmd = true;
                    if let Ok(mut decode) = self.handles.decode.lock() {
                        decode.state = DecodeState::Stopped;
                    }
                    if stream.state.is_open() {
                        self.backend.stream_disconnect();
                    }
                }
            }
            DecodeState::Error => {
                warn!("Decoder error");
                stmn = true;
                if let Ok(mut decode) = self.handles.decode.lock() {
                    decode.state = DecodeState::Stopped;
                }
                if stream.state.is_open() {
                    self.backend.stream_disconnect();
                }
            }
            _ => {}
        }

        // Graceful end of track: stream gone and nothing left to render
        if !self.latches.sent_stmu
            && self.latches.can_stmdu
            && out.state == OutputState::Running
            && out.completed
            && stream.state == StreamState::Stopped
            && dec == DecodeState::Stopped
            && render == RenderState::Stopped
        {
            stmu = true;
            self.latches.sent_stmu = true;
            if let Ok(mut output) = self.handles.output.lock() {
                output.state = OutputState::Stopped;
                output.flow = false;
            }
        }

        // Rendering stopped while the connection still looks alive
        if !self.latches.sent_stmo
            && self.latches.can_stmdu
            && out.state == OutputState::Running
            && out.completed
            && stream.state.is_open()
            && render == RenderState::Stopped
        {
            stmo = true;
            self.latches.sent_stmo = true;
            if let Ok(mut output) = self.handles.output.lock() {
                output.state = OutputState::Stopped;
            }
        }

        if let Some(code) = dsco {
            debug!("Stream disconnected: {:?}", code);
            self.slim_tx.send(ClientMessage::Dsco(code)).ok();
        }
        if stms {
            self.send_status(StatusCode::TrackStarted);
        }
        if stmt {
            self.send_status(StatusCode::Timer);
        }
        if stml {
            self.send_status(StatusCode::BufferThreshold);
        }
        if stmd {
            self.send_status(StatusCode::DecoderReady);
        }
        if stmu {
            self.send_status(StatusCode::Underrun);
        }
        if stmo {
            self.send_status(StatusCode::Overrun);
        }
        if stmn {
            self.send_status(StatusCode::NotSupported);
        }
        if let Some(headers) = resp {
            self.slim_tx.send(ClientMessage::Resp(headers)).ok();
        }
        if let Some(meta) = meta {
            self.slim_tx.send(ClientMessage::Meta(meta)).ok();
        }

        if self.cfg.send_icy
            && out.state == OutputState::Running
            && self.last_icy.elapsed() >= ICY_UPDATE_TIME
        {
            self.last_icy = Instant::now();
            let meta = self.backend.metadata(0);
            self.backend.set_icy(&meta, false);
        }
    }
}

/// Spawn the controller on its own thread. The caller keeps the bridge
/// receiver and the shutdown flag.
pub fn spawn<B: Backend + 'static>(
    cfg: Config,
    backend: B,
    bridge: Sender<BridgeCmd>,
    handles: PlayerHandles,
    running: Arc<AtomicCell<bool>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let (slim_tx, slim_rx) = unbounded();
        let controller = Controller::new(cfg, backend, bridge, slim_tx, handles, running);
        controller.run(slim_rx);
    })
}
