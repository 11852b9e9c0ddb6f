//! Audio file decoding using symphonia, tag reading using lofty.
//!
//! Supported formats: MP3, FLAC, OGG Vorbis, WAV/PCM, AAC (in MP4).

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use crate::error::{Error, Result};
use crate::source::{MetadataKey, MetadataValue, TrackMetadata};

/// Extensions the file source accepts.
pub const ALLOWED_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "wav", "m4a", "aac"];

/// Whether `path` has an allowed audio extension.
pub fn is_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            let lower = ext.to_ascii_lowercase();
            ALLOWED_EXTENSIONS.contains(&lower.as_str())
        })
}

/// Streaming decoder for one audio file.
pub struct AudioDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
    duration: Option<Duration>,
    sample_buf: Option<SampleBuffer<f32>>,
}

impl AudioDecoder {
    /// Open a file for decoding.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|_| Error::not_found(path.display().to_string()))?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension() {
            hint.with_extension(&ext.to_string_lossy());
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| Error::invalid_argument(format!("unsupported format: {e}")))?;

        let reader = probed.format;
        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::invalid_argument("no audio track found"))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| Error::invalid_argument("unknown sample rate"))?;
        let channels = codec_params.channels.map(|c| c.count() as u16).unwrap_or(2);

        let duration = codec_params
            .n_frames
            .map(|frames| Duration::from_secs_f64(frames as f64 / sample_rate as f64));

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| Error::invalid_argument(format!("unsupported codec: {e}")))?;

        Ok(Self {
            reader,
            decoder,
            track_id,
            sample_rate,
            channels,
            duration,
            sample_buf: None,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Decode the next block of interleaved f32 samples at the native
    /// rate/channel count. `None` at end of stream.
    pub fn next_block(&mut self) -> Result<Option<Vec<f32>>> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => return Err(Error::external(format!("demux error: {e}"))),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let frames = decoded.capacity() as u64;
                    let buf = self.sample_buf.get_or_insert_with(|| {
                        SampleBuffer::<f32>::new(frames, spec)
                    });
                    if buf.capacity() < decoded.capacity() * spec.channels.count() {
                        *buf = SampleBuffer::<f32>::new(frames, spec);
                    }
                    buf.copy_interleaved_ref(decoded);
                    return Ok(Some(buf.samples().to_vec()));
                }
                // Recoverable: skip the bad packet
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::debug!("skipping undecodable packet: {e}");
                    continue;
                }
                Err(e) => return Err(Error::external(format!("decode error: {e}"))),
            }
        }
    }

    /// Seek to an absolute position. Returns the actual landing position.
    pub fn seek(&mut self, position: Duration) -> Result<Duration> {
        let time = Time::from(position.as_secs_f64());
        let seeked = self
            .reader
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::external(format!("seek failed: {e}")))?;
        self.decoder.reset();

        let landed = Duration::from_secs_f64(seeked.actual_ts as f64 / self.sample_rate as f64);
        Ok(landed)
    }
}

/// Read tag metadata for a file; absent tags stay absent (defaults are
/// substituted at the DTO boundary).
pub fn read_tags(path: &Path) -> TrackMetadata {
    use lofty::file::{AudioFile, TaggedFileExt};
    use lofty::prelude::Accessor;

    let mut meta = TrackMetadata::new();

    let tagged = match lofty::probe::Probe::open(path).and_then(|p| p.read()) {
        Ok(t) => t,
        Err(e) => {
            tracing::debug!(path = %path.display(), "tag read failed: {e}");
            if let Some(stem) = path.file_stem() {
                meta.set_text(MetadataKey::Title, stem.to_string_lossy());
            }
            return meta;
        }
    };

    let duration = tagged.properties().duration();
    if !duration.is_zero() {
        meta.set(
            MetadataKey::Duration,
            MetadataValue::Float(duration.as_secs_f64()),
        );
    }

    if let Some(tag) = tagged.primary_tag() {
        if let Some(title) = tag.title() {
            meta.set_text(MetadataKey::Title, title.as_ref());
        }
        if let Some(artist) = tag.artist() {
            meta.set_text(MetadataKey::Artist, artist.as_ref());
        }
        if let Some(album) = tag.album() {
            meta.set_text(MetadataKey::Album, album.as_ref());
        }
        if let Some(genre) = tag.genre() {
            meta.set_text(MetadataKey::Genre, genre.as_ref());
        }
        if let Some(year) = tag.year() {
            meta.set(MetadataKey::Year, MetadataValue::Integer(year as i64));
        }
        if let Some(track) = tag.track() {
            meta.set(MetadataKey::TrackNumber, MetadataValue::Integer(track as i64));
        }
    }

    // Filename fallback keeps the title invariant meaningful
    if !meta.contains(MetadataKey::Title) {
        if let Some(stem) = path.file_stem() {
            meta.set_text(MetadataKey::Title, stem.to_string_lossy());
        }
    }

    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_extension_allow_list() {
        assert!(is_supported_extension(Path::new("a.mp3")));
        assert!(is_supported_extension(Path::new("b.FLAC")));
        assert!(!is_supported_extension(Path::new("c.txt")));
        assert!(!is_supported_extension(Path::new("noext")));
    }

    #[test]
    fn test_open_missing_file_is_not_found() {
        let err = match AudioDecoder::open(Path::new("/definitely/not/here.mp3")) {
            Err(e) => e,
            Ok(_) => panic!("expected AudioDecoder::open to fail"),
        };
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_read_tags_untagged_file_uses_stem() {
        // A nonexistent path exercises the fallback branch
        let meta = read_tags(&PathBuf::from("/nowhere/my-song.mp3"));
        assert_eq!(meta.display_title(), "my-song");
    }
}
