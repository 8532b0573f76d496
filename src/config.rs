use std::{fmt, str::FromStr};

/// Longest player name the server-side settings page accepts.
pub const NAME_LEN: usize = 64;

/// Desired encoding of the bridge-facing stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encode {
    Pcm,
    Flac { level: Option<u8> },
    Mp3 { bitrate: Option<u32> },
    Thru,
}

/// Parsed `mode` string, e.g. `flc:5,r:-48000,flow` or `thru`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub encode: Encode,
    pub flow: bool,
    /// Explicit encode rate (`r:`); negative caps against the source rate.
    pub rate: Option<i32>,
    /// Explicit encode sample size (`s:`).
    pub sample_size: Option<u8>,
}

impl Default for Mode {
    fn default() -> Self {
        Mode {
            encode: Encode::Thru,
            flow: false,
            rate: None,
            sample_size: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ModeParseError(String);

impl fmt::Display for ModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unrecognised mode element: {}", self.0)
    }
}

impl std::error::Error for ModeParseError {}

impl FromStr for Mode {
    type Err = ModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mode = Mode::default();
        for element in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match element.split_once(':') {
                None => match element {
                    "pcm" => mode.encode = Encode::Pcm,
                    "flc" => mode.encode = Encode::Flac { level: None },
                    "mp3" => mode.encode = Encode::Mp3 { bitrate: None },
                    "thru" => mode.encode = Encode::Thru,
                    "flow" => mode.flow = true,
                    other => return Err(ModeParseError(other.to_owned())),
                },
                Some((key, value)) => {
                    let parsed = value
                        .parse::<i64>()
                        .map_err(|_| ModeParseError(element.to_owned()))?;
                    match key {
                        "flc" => mode.encode = Encode::Flac {
                            level: Some(parsed as u8),
                        },
                        "mp3" => mode.encode = Encode::Mp3 {
                            bitrate: Some(parsed as u32),
                        },
                        "r" => mode.rate = Some(parsed as i32),
                        "s" => mode.sample_size = Some(parsed as u8),
                        other => return Err(ModeParseError(other.to_owned())),
                    }
                }
            }
        }
        Ok(mode)
    }
}

/// Container preference for raw PCM output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawFormat {
    pub wav: bool,
    pub aif: bool,
}

impl FromStr for RawFormat {
    type Err = ModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut raw = RawFormat::default();
        for element in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match element {
                "wav" => raw.wav = true,
                "aif" => raw.aif = true,
                other => return Err(ModeParseError(other.to_owned())),
            }
        }
        Ok(raw)
    }
}

/// What to do with 24-bit sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum L24Format {
    /// Truncate to 16 bits always
    Trunc16,
    /// Truncate to 16 bits only when outputting raw PCM
    Trunc16Pcm,
    /// Pass 24-bit samples through
    #[default]
    Packed,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Explicit server address, or None for auto-discovery.
    pub server: Option<std::net::SocketAddrV4>,
    pub name: String,
    pub mac: [u8; 6],
    pub mode: Mode,
    /// Highest sample rate advertised to the server.
    pub sample_rate: u32,
    /// Codec list advertised in HELO, e.g. "flc,pcm,mp3".
    pub codecs: String,
    pub send_icy: bool,
    pub raw_audio_format: RawFormat,
    pub l24_format: L24Format,
    pub streambuf_size: usize,
    pub outputbuf_size: usize,
    /// Advertised length of the bridge stream, None for chunked.
    pub stream_length: Option<u64>,
    /// Host and port the bridge serves decoded audio on.
    pub bridge_host: String,
    pub bridge_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: None,
            name: "slimwire".to_owned(),
            mac: [0x00, 0x04, 0x20, 0x12, 0x34, 0x56],
            mode: Mode::default(),
            sample_rate: 192000,
            codecs: "flc,pcm,mp3,aac,ogg,alc".to_owned(),
            send_icy: false,
            raw_audio_format: RawFormat { wav: true, aif: false },
            l24_format: L24Format::Packed,
            streambuf_size: 2 * 1024 * 1024,
            outputbuf_size: 4 * 1024 * 1024,
            stream_length: None,
            bridge_host: "localhost".to_owned(),
            bridge_port: 8000,
        }
    }
}

/// Parse a `aa:bb:cc:dd:ee:ff` hardware address.
pub fn parse_mac(s: &str) -> Result<[u8; 6], String> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for slot in mac.iter_mut() {
        let part = parts.next().ok_or_else(|| format!("Bad MAC: {}", s))?;
        *slot = u8::from_str_radix(part, 16).map_err(|_| format!("Bad MAC: {}", s))?;
    }
    if parts.next().is_some() {
        return Err(format!("Bad MAC: {}", s));
    }
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_modes() {
        assert_eq!(
            "thru".parse::<Mode>().unwrap(),
            Mode {
                encode: Encode::Thru,
                ..Mode::default()
            }
        );
        assert_eq!("pcm".parse::<Mode>().unwrap().encode, Encode::Pcm);
        assert_eq!(
            "flc".parse::<Mode>().unwrap().encode,
            Encode::Flac { level: None }
        );
    }

    #[test]
    fn parses_modifiers() {
        let mode: Mode = "flc:5,r:-48000,s:16,flow".parse().unwrap();
        assert_eq!(mode.encode, Encode::Flac { level: Some(5) });
        assert_eq!(mode.rate, Some(-48000));
        assert_eq!(mode.sample_size, Some(16));
        assert!(mode.flow);

        let mode: Mode = "mp3:320".parse().unwrap();
        assert_eq!(mode.encode, Encode::Mp3 { bitrate: Some(320) });
        assert!(!mode.flow);
    }

    #[test]
    fn rejects_unknown_elements() {
        assert!("wavpack".parse::<Mode>().is_err());
        assert!("r:fast".parse::<Mode>().is_err());
    }

    #[test]
    fn parses_raw_format_list() {
        let raw: RawFormat = "wav,aif".parse().unwrap();
        assert!(raw.wav && raw.aif);
        let raw: RawFormat = "aif".parse().unwrap();
        assert!(!raw.wav && raw.aif);
    }

    #[test]
    fn parses_mac() {
        assert_eq!(
            parse_mac("00:04:20:ab:CD:ef").unwrap(),
            [0x00, 0x04, 0x20, 0xab, 0xcd, 0xef]
        );
        assert!(parse_mac("00:04:20:ab:cd").is_err());
        assert!(parse_mac("00:04:20:ab:cd:ef:01").is_err());
        assert!(parse_mac("zz:04:20:ab:cd:ef").is_err());
    }
}
