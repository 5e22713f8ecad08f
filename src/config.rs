use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use meeting_media::media::types::{OutputFormat, PipelineConfig};

pub struct RecorderConfig {
    host: String,
    port: u16,
    output_path: PathBuf,
    output_format: OutputFormat,
    frame_size: (u32, u32),
}

impl RecorderConfig {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let output_format = match lookup("MEETING_MEDIA_FORMAT").as_deref() {
            Some("mp4") | Some("file") => OutputFormat::File,
            Some("flv") | Some("streamable") | None => OutputFormat::Streamable,
            Some(other) => {
                log::warn!("unknown MEETING_MEDIA_FORMAT {:?}, using flv", other);
                OutputFormat::Streamable
            }
        };
        let default_output = format!("recording.{}", output_format.container());
        let defaults = PipelineConfig::default().video_frame_size;

        Self {
            host: lookup("MEETING_MEDIA_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse(&lookup, "MEETING_MEDIA_PORT", 8765),
            output_path: lookup("MEETING_MEDIA_OUTPUT")
                .unwrap_or(default_output)
                .into(),
            output_format,
            frame_size: (
                parse(&lookup, "MEETING_MEDIA_WIDTH", defaults.0),
                parse(&lookup, "MEETING_MEDIA_HEIGHT", defaults.1),
            ),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            output_format: self.output_format,
            video_frame_size: self.frame_size,
            ..Default::default()
        }
    }
}

fn parse<T: FromStr + Copy>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            log::warn!("ignoring invalid {}={:?}", key, raw);
            default
        }),
        None => default,
    }
}

pub fn config() -> &'static RecorderConfig {
    static CONFIG: LazyLock<RecorderConfig> =
        LazyLock::new(|| RecorderConfig::from_lookup(|key| std::env::var(key).ok()));
    &CONFIG
}
