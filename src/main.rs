use std::{
    net::{Ipv4Addr, SocketAddrV4},
    str::FromStr,
    sync::Arc,
};

use clap::{
    builder::{PossibleValuesParser, TypedValueParser},
    Parser,
};
use crossbeam::{atomic::AtomicCell, channel::bounded};
use log::info;
use simple_logger::SimpleLogger;

mod backend;
mod buffer;
mod config;
mod controller;
mod discover;
mod dummy;
mod message;
mod mimetype;
mod negotiate;
mod proto;
mod startup;
mod state;
mod status;

use config::{Config, L24Format, Mode, RawFormat};
use dummy::DummyBackend;
use message::BridgeCmd;
use proto::SLIM_PORT;
use state::PlayerHandles;

#[derive(Parser)]
#[command(version)]
struct Cli {
    #[arg(short, name = "SERVER[:PORT]", value_parser = cli_server_parser, help = "Connect to the specified server, otherwise use autodiscovery")]
    server: Option<SocketAddrV4>,

    #[arg(short, help = "Set the player name, defaults to the hostname")]
    name: Option<String>,

    #[arg(short, value_parser = config::parse_mac, help = "Set the player MAC address")]
    mac: Option<[u8; 6]>,

    #[arg(long, default_value = "thru", value_parser = cli_mode_parser, help = "Processing mode, e.g. thru, pcm, flc:5,r:-48000,flow")]
    mode: Mode,

    #[arg(short, long, default_value_t = 192000, help = "Maximum sample rate advertised to the server")]
    rate: u32,

    #[arg(long, default_value = "flc,pcm,mp3,aac,ogg,alc", help = "Codecs advertised to the server")]
    codecs: String,

    #[arg(long, help = "Push ICY metadata towards the player")]
    icy: bool,

    #[arg(long, default_value = "wav", value_parser = cli_raw_parser, help = "Container preference for raw audio: wav and/or aif")]
    raw: RawFormat,

    #[arg(long, value_enum, default_value = "packed", help = "Handling of 24-bit sources")]
    l24: L24Format,

    #[arg(long, default_value_t = 4 * 1024 * 1024, help = "Output buffer size in bytes")]
    outputbuf: usize,

    #[arg(long, default_value_t = 8000, help = "Port the bridge serves decoded audio on")]
    bridge_port: u16,

    #[arg(long, help = "Install a systemd user unit and exit")]
    install: bool,

    #[arg(long,
        default_value = "info",
        value_parser = PossibleValuesParser::new(["trace", "debug", "error", "warn", "info", "off"])
            .map(|s| s.parse::<log::LevelFilter>().unwrap()),
        help = "Set the highest log level")]
    loglevel: log::LevelFilter,
}

fn cli_server_parser(value: &str) -> anyhow::Result<SocketAddrV4> {
    match value.split_once(':') {
        Some((ip_str, port_str)) if port_str.is_empty() => {
            Ok(SocketAddrV4::new(Ipv4Addr::from_str(ip_str)?, SLIM_PORT))
        }
        Some(_) => Ok(value.parse()?),
        None => Ok(SocketAddrV4::new(Ipv4Addr::from_str(value)?, SLIM_PORT)),
    }
}

fn cli_mode_parser(value: &str) -> Result<Mode, config::ModeParseError> {
    value.parse()
}

fn cli_raw_parser(value: &str) -> Result<RawFormat, config::ModeParseError> {
    value.parse()
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    SimpleLogger::new()
        .with_colors(true)
        .with_level(cli.loglevel)
        .init()?;

    if cli.install {
        return startup::create_systemd_unit(&cli.server.map(|s| s.to_string()));
    }

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_owned());

    let defaults = Config::default();
    let cfg = Config {
        server: cli.server,
        name: cli.name.unwrap_or_else(|| host.clone()),
        mac: cli.mac.unwrap_or(defaults.mac),
        mode: cli.mode,
        sample_rate: cli.rate,
        codecs: cli.codecs,
        send_icy: cli.icy,
        raw_audio_format: cli.raw,
        l24_format: cli.l24,
        outputbuf_size: cli.outputbuf,
        bridge_host: host,
        bridge_port: cli.bridge_port,
        ..defaults
    };

    let handles = PlayerHandles::new(cfg.streambuf_size, cfg.outputbuf_size);
    let backend = DummyBackend::new(handles.clone());
    let (bridge_tx, bridge_rx) = bounded(10);
    let running = Arc::new(AtomicCell::new(true));

    let controller = controller::spawn(cfg, backend, bridge_tx, handles, running.clone());

    // The bridge side: a real deployment points the hardware player at
    // each SetTrack URL, here we narrate what the server asked for
    while let Ok(cmd) = bridge_rx.recv() {
        match cmd {
            BridgeCmd::SetTrack {
                index,
                url,
                mimetype,
            } => info!("Track {} available at {} as {}", index, url, mimetype),
            BridgeCmd::Play => info!("Playback started"),
            BridgeCmd::Pause => info!("Playback paused"),
            BridgeCmd::Unpause => info!("Playback resumed"),
            BridgeCmd::Stop => info!("Playback stopped"),
            BridgeCmd::Volume(v) => info!("Volume set to {:.2}", v),
            BridgeCmd::OnOff(on) => info!("Player powered {}", if on { "on" } else { "off" }),
            BridgeCmd::SetName(name) => info!("Player renamed to {}", name),
            BridgeCmd::SetServer(ip) => info!("Now controlled by {}", ip),
        }
    }

    running.store(false);
    controller.join().ok();
    Ok(())
}
