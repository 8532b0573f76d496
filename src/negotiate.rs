use crossbeam::channel::Sender;
use log::{debug, info, warn};

use crate::{
    backend::Backend,
    config::{Config, Encode, L24Format},
    message::BridgeCmd,
    mimetype,
    proto::Format,
    state::PlayerHandles,
};

/// Path stem of the URL the bridge serves each track under.
pub const BRIDGE_URL: &str = "stream-";

pub const PCM_SAMPLE_SIZES: [u8; 4] = [8, 16, 24, 32];
pub const PCM_SAMPLE_RATES: [u32; 15] = [
    11025, 22050, 32000, 44100, 48000, 8000, 12000, 16000, 24000, 96000, 88200, 176400, 192000,
    352800, 384000,
];
pub const PCM_CHANNELS: [u8; 2] = [1, 2];

/// The coded format fields of a `strm s` or `codc` frame.
#[derive(Debug, Clone, Copy)]
pub struct StreamFormat {
    pub format: Format,
    pub pcm_sample_size: u8,
    pub pcm_sample_rate: u8,
    pub pcm_channels: u8,
    pub pcm_endian: u8,
}

fn decode_index<T: Copy>(table: &[T], byte: u8) -> Option<T> {
    if byte == b'?' {
        return None;
    }
    (byte as char)
        .to_digit(16)
        .and_then(|idx| table.get(idx as usize))
        .copied()
}

/// Map a stream start onto a concrete decoder and bridge mime-type, open
/// the decoder and output, and hand the new track URL to the bridge.
/// False means the track is abandoned and the caller reports STMn.
pub fn process_start<B: Backend>(
    fmt: &StreamFormat,
    cfg: &Config,
    backend: &mut B,
    bridge: &Sender<BridgeCmd>,
    handles: &PlayerHandles,
) -> bool {
    if matches!(fmt.format, Format::Unknown(_) | Format::SelfDescribing) {
        warn!("Unknown codec {:?}", fmt.format);
        return false;
    }

    let (index, flow_active) = match handles.output.lock() {
        Ok(mut output) => {
            output.index += 1;
            (output.index, output.flow)
        }
        Err(_) => return false,
    };

    // Metadata lookup skips over tracks that never rendered
    let offset = match handles.render.lock() {
        Ok(render) if render.index > 0 => index - render.index,
        _ => 0,
    };

    handles.outputbuf.resize(cfg.outputbuf_size);

    let meta = backend.metadata(offset);

    // Source parameters; '?' means the decoder detects them itself
    let sample_size = decode_index(&PCM_SAMPLE_SIZES, fmt.pcm_sample_size).unwrap_or(16);
    let mut sample_rate = decode_index(&PCM_SAMPLE_RATES, fmt.pcm_sample_rate).unwrap_or(44100);
    let channels = decode_index(&PCM_CHANNELS, fmt.pcm_channels).unwrap_or(2);
    let big_endian = fmt.pcm_endian == b'0';

    if sample_rate > cfg.sample_rate {
        warn!(
            "Server rate {} above configured cap, using {}",
            sample_rate, cfg.sample_rate
        );
        sample_rate = cfg.sample_rate;
    }

    // Mid-flow track change: the output chain is already set up, only a
    // fresh decoder is needed
    if flow_active {
        debug!("Flow continues at track {}", index);
        return backend
            .codec_open(fmt.format, sample_size, sample_rate, channels, big_endian)
            .is_ok();
    }

    let mut mode = cfg.mode;
    if mode.flow && mode.encode == Encode::Thru {
        // Pass-through cannot splice tracks into one stream
        mode.flow = false;
    }

    if mode.flow {
        if let Ok(mut output) = handles.output.lock() {
            output.flow = true;
        }
        backend.set_icy(&meta, true);
    }

    // Flow splices every track into one continuous stream, so its encode
    // parameters are pinned up front instead of following the first track
    let (base_rate, base_size, encode_channels) = if mode.flow {
        (44100, 16, 2)
    } else {
        (sample_rate, sample_size, channels)
    };

    let encode_rate = match mode.rate {
        Some(rate) if rate > 0 => rate as u32,
        Some(rate) => base_rate.min((-rate) as u32),
        None => base_rate,
    };

    let mut encode_size = mode.sample_size.unwrap_or(base_size);
    if encode_size == 24 {
        encode_size = match cfg.l24_format {
            L24Format::Trunc16 => 16,
            L24Format::Trunc16Pcm if matches!(mode.encode, Encode::Pcm) => 16,
            _ => 24,
        };
    }

    let mimetype = match mode.encode {
        Encode::Thru => match fmt.format {
            Format::Pcm => mimetype::find_pcm_mimetype(
                encode_size,
                encode_rate,
                encode_channels,
                cfg.raw_audio_format,
            ),
            codec => match mimetype::find_mimetype(codec) {
                Some(m) => m.to_owned(),
                None => {
                    warn!("No mimetype for {:?}", codec);
                    return false;
                }
            },
        },
        Encode::Pcm => mimetype::find_pcm_mimetype(
            encode_size,
            encode_rate,
            encode_channels,
            cfg.raw_audio_format,
        ),
        Encode::Flac { .. } => "audio/flac".to_owned(),
        Encode::Mp3 { .. } => "audio/mpeg".to_owned(),
    };

    if backend
        .codec_open(fmt.format, sample_size, sample_rate, channels, big_endian)
        .is_err()
    {
        warn!("Decoder refused {:?}", fmt.format);
        return false;
    }

    if backend.output_start().is_err() {
        warn!("Output failed to start");
        return false;
    }

    let url = format!(
        "http://{}:{}/{}{}.{}",
        cfg.bridge_host,
        cfg.bridge_port,
        BRIDGE_URL,
        index,
        mimetype::mimetype2ext(&mimetype)
    );
    info!("Track {} ready at {} as {}", index, url, mimetype);
    bridge
        .send(BridgeCmd::SetTrack {
            index,
            url,
            mimetype,
        })
        .ok();

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dummy::DummyBackend, state::DecodeState};
    use crossbeam::channel::unbounded;

    fn setup() -> (Config, DummyBackend, PlayerHandles) {
        let handles = PlayerHandles::new(1024, 1024);
        let backend = DummyBackend::new(handles.clone());
        (Config::default(), backend, handles)
    }

    fn pcm_format() -> StreamFormat {
        StreamFormat {
            format: Format::Pcm,
            pcm_sample_size: b'1',
            pcm_sample_rate: b'3',
            pcm_channels: b'1',
            pcm_endian: b'1',
        }
    }

    #[test]
    fn decode_tables_match_wire_bytes() {
        assert_eq!(decode_index(&PCM_SAMPLE_SIZES, b'1'), Some(16));
        assert_eq!(decode_index(&PCM_SAMPLE_RATES, b'3'), Some(44100));
        assert_eq!(decode_index(&PCM_SAMPLE_RATES, b'c'), Some(192000));
        assert_eq!(decode_index(&PCM_CHANNELS, b'1'), Some(2));
        assert_eq!(decode_index(&PCM_CHANNELS, b'?'), None);
        assert_eq!(decode_index(&PCM_SAMPLE_RATES, b'z'), None);
    }

    #[test]
    fn happy_path_publishes_track() {
        let (cfg, mut backend, handles) = setup();
        let (tx, rx) = unbounded();

        assert!(process_start(&pcm_format(), &cfg, &mut backend, &tx, &handles));
        assert_eq!(
            handles.decode.lock().unwrap().state,
            DecodeState::Ready
        );
        assert_eq!(handles.output.lock().unwrap().index, 1);
        assert_eq!(handles.outputbuf.size(), cfg.outputbuf_size);

        match rx.try_recv().unwrap() {
            BridgeCmd::SetTrack {
                index,
                url,
                mimetype,
            } => {
                assert_eq!(index, 1);
                assert_eq!(url, "http://localhost:8000/stream-1.wav");
                assert_eq!(mimetype, "audio/wav");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_codec_fails() {
        let (cfg, mut backend, handles) = setup();
        let (tx, rx) = unbounded();
        let fmt = StreamFormat {
            format: Format::Unknown(b'x'),
            ..pcm_format()
        };
        assert!(!process_start(&fmt, &cfg, &mut backend, &tx, &handles));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn rate_is_clamped_to_configured_cap() {
        let (mut cfg, mut backend, handles) = setup();
        cfg.sample_rate = 48000;
        let (tx, rx) = unbounded();
        let fmt = StreamFormat {
            pcm_sample_rate: b'c', // 192000
            ..pcm_format()
        };
        assert!(process_start(&fmt, &cfg, &mut backend, &tx, &handles));
        match rx.try_recv().unwrap() {
            BridgeCmd::SetTrack { mimetype, .. } => assert_eq!(mimetype, "audio/wav"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn explicit_rate_beats_source_rate() {
        let (mut cfg, mut backend, handles) = setup();
        cfg.mode = "pcm,r:48000".parse().unwrap();
        cfg.raw_audio_format = Default::default();
        let (tx, rx) = unbounded();
        assert!(process_start(&pcm_format(), &cfg, &mut backend, &tx, &handles));
        match rx.try_recv().unwrap() {
            BridgeCmd::SetTrack { mimetype, .. } => {
                assert_eq!(mimetype, "audio/L16;rate=48000;channels=2");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn negative_rate_caps_against_source() {
        let (mut cfg, mut backend, handles) = setup();
        cfg.mode = "pcm,r:-32000".parse().unwrap();
        cfg.raw_audio_format = Default::default();
        let (tx, rx) = unbounded();
        // Source at 44100 gets capped down to 32000
        assert!(process_start(&pcm_format(), &cfg, &mut backend, &tx, &handles));
        match rx.try_recv().unwrap() {
            BridgeCmd::SetTrack { mimetype, .. } => {
                assert_eq!(mimetype, "audio/L16;rate=32000;channels=2");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn l24_truncation_modes() {
        let (mut cfg, mut backend, handles) = setup();
        cfg.mode = "pcm".parse().unwrap();
        cfg.raw_audio_format = Default::default();
        cfg.l24_format = L24Format::Trunc16;
        let fmt = StreamFormat {
            pcm_sample_size: b'2', // 24 bit
            ..pcm_format()
        };
        let (tx, rx) = unbounded();
        assert!(process_start(&fmt, &cfg, &mut backend, &tx, &handles));
        match rx.try_recv().unwrap() {
            BridgeCmd::SetTrack { mimetype, .. } => {
                assert_eq!(mimetype, "audio/L16;rate=44100;channels=2");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn thru_follows_source_codec_with_flac_container_matched() {
        let (mut cfg, mut backend, handles) = setup();
        cfg.mode = "thru,flow".parse().unwrap();
        let fmt = StreamFormat {
            format: Format::Flac,
            ..pcm_format()
        };
        let (tx, rx) = unbounded();
        assert!(process_start(&fmt, &cfg, &mut backend, &tx, &handles));
        match rx.try_recv().unwrap() {
            BridgeCmd::SetTrack { url, mimetype, .. } => {
                assert_eq!(mimetype, "audio/flac");
                assert_eq!(mimetype::mimetype2format(&mimetype), b'c');
                assert!(url.ends_with("stream-1.flac"));
            }
            other => panic!("unexpected {:?}", other),
        }
        // Flow was silently dropped for pass-through
        assert!(!handles.output.lock().unwrap().flow);
    }

    #[test]
    fn flow_pins_encode_params_regardless_of_first_track() {
        let (mut cfg, mut backend, handles) = setup();
        cfg.mode = "pcm,flow".parse().unwrap();
        cfg.raw_audio_format = Default::default();
        // Mono 11025 Hz source must not leak into the flow encode side
        let fmt = StreamFormat {
            pcm_sample_rate: b'0',
            pcm_channels: b'0',
            ..pcm_format()
        };
        let (tx, rx) = unbounded();
        assert!(process_start(&fmt, &cfg, &mut backend, &tx, &handles));
        match rx.try_recv().unwrap() {
            BridgeCmd::SetTrack { mimetype, .. } => {
                assert_eq!(mimetype, "audio/L16;rate=44100;channels=2");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(handles.output.lock().unwrap().flow);
    }

    #[test]
    fn flow_reuses_output_chain_for_next_track() {
        let (mut cfg, mut backend, handles) = setup();
        cfg.mode = "flc,flow".parse().unwrap();
        let (tx, rx) = unbounded();

        assert!(process_start(&pcm_format(), &cfg, &mut backend, &tx, &handles));
        assert!(handles.output.lock().unwrap().flow);
        assert!(rx.try_recv().is_ok());

        // Second track in flow: decoder opens but no new bridge URL
        assert!(process_start(&pcm_format(), &cfg, &mut backend, &tx, &handles));
        assert_eq!(handles.output.lock().unwrap().index, 2);
        assert!(rx.try_recv().is_err());
    }
}
