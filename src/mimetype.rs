use crate::{config::RawFormat, proto::Format};

/// Mime-type for a compressed codec.
pub fn find_mimetype(format: Format) -> Option<&'static str> {
    match format {
        Format::Flac => Some("audio/flac"),
        Format::Mp3 => Some("audio/mpeg"),
        Format::Aac => Some("audio/aac"),
        Format::Ogg => Some("audio/ogg"),
        Format::Alac => Some("audio/m4a"),
        _ => None,
    }
}

/// Mime-type for raw PCM, honouring the configured container preference.
/// Without a container the audio/L<n> form carries rate and channels.
pub fn find_pcm_mimetype(sample_size: u8, sample_rate: u32, channels: u8, raw: RawFormat) -> String {
    if raw.wav {
        "audio/wav".to_owned()
    } else if raw.aif {
        "audio/aiff".to_owned()
    } else {
        format!(
            "audio/L{};rate={};channels={}",
            sample_size, sample_rate, channels
        )
    }
}

/// Wire format byte a mime-type corresponds to. FLAC maps to the
/// container-matched code `c` rather than the raw frame code `f`.
pub fn mimetype2format(mimetype: &str) -> u8 {
    match mimetype {
        "audio/flac" => b'c',
        "audio/mpeg" => b'm',
        "audio/aac" => b'a',
        "audio/ogg" => b'o',
        "audio/m4a" => b'l',
        _ => b'p',
    }
}

/// File extension used in the bridge URL.
pub fn mimetype2ext(mimetype: &str) -> &'static str {
    match mimetype {
        "audio/flac" => "flac",
        "audio/mpeg" => "mp3",
        "audio/aac" => "aac",
        "audio/ogg" => "ogg",
        "audio/m4a" => "m4a",
        "audio/wav" => "wav",
        "audio/aiff" => "aif",
        _ => "pcm",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_mimetypes() {
        assert_eq!(find_mimetype(Format::Flac), Some("audio/flac"));
        assert_eq!(find_mimetype(Format::Mp3), Some("audio/mpeg"));
        assert_eq!(find_mimetype(Format::Pcm), None);
        assert_eq!(find_mimetype(Format::Unknown(b'x')), None);
    }

    #[test]
    fn pcm_mimetype_prefers_configured_container() {
        let wav = RawFormat { wav: true, aif: true };
        assert_eq!(find_pcm_mimetype(16, 44100, 2, wav), "audio/wav");

        let aif = RawFormat { wav: false, aif: true };
        assert_eq!(find_pcm_mimetype(16, 44100, 2, aif), "audio/aiff");

        let bare = RawFormat::default();
        assert_eq!(
            find_pcm_mimetype(24, 96000, 2, bare),
            "audio/L24;rate=96000;channels=2"
        );
    }

    #[test]
    fn flac_is_container_matched() {
        assert_eq!(mimetype2format("audio/flac"), b'c');
        assert_eq!(mimetype2ext("audio/flac"), "flac");
        assert_eq!(mimetype2ext("audio/wav"), "wav");
    }
}
