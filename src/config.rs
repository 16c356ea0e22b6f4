//! # Configuration Management
//!
//! Loads the engine configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Well-known variables (`GEMINI_API_KEY`, `API_KEY`)
//! 2. Environment variables (APP_ENDPOINT_URL, APP_EXAM_LANGUAGE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::audio::codec::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::error::SessionResult;
use crate::exam::ExamSessionConfig;
use crate::session::EngineSettings;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Default Live API WebSocket endpoint.
pub const DEFAULT_ENDPOINT_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default native-audio model.
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";

/// Main configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one concern (remote endpoint, audio pipeline, devices,
/// exam parameters) and to one `[section]` table in config.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub endpoint: EndpointConfig,
    pub audio: AudioSettings,
    pub devices: DevicesConfig,
    pub exam: ExamSettings,
}

/// Remote conversational endpoint.
///
/// ## Fields:
/// - `url`: WebSocket URL of the bidirectional Live API
/// - `api_key`: sent as the `key` query parameter
/// - `model`: model resource name requested in `setup`
/// - `voice`: prebuilt voice used for the examiner (e.g. "Puck")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
}

/// Audio pipeline parameters.
///
/// ## Tuning guidelines:
/// - `frame_size`: 4096 samples = 256 ms per outbound frame at 16 kHz
/// - capture buffering is fixed at one frame; anything beyond is dropped rather
///   than delayed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    /// Channels in the inbound speech payload
    pub channels: u16,
    pub frame_size: usize,
    pub analyser_fft_size: usize,
}

/// Device selection.
///
/// ## Values:
/// - `"native"`: system default device (needs the `native-audio` feature)
/// - `"null"` (output only): discard speech, keep timing
/// - anything else: path of a WAV file to read (input) or write (output)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    pub input: String,
    pub output: String,
}

/// Exam parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamSettings {
    pub examiner_style: String,
    pub language: String,
    pub difficulty: String,
    pub total_questions: u32,
    /// Text file holding the syllabus
    pub syllabus_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let native = cfg!(feature = "native-audio");
        Self {
            endpoint: EndpointConfig {
                url: DEFAULT_ENDPOINT_URL.to_string(),
                api_key: String::new(),
                model: DEFAULT_MODEL.to_string(),
                voice: "Puck".to_string(),
            },
            audio: AudioSettings {
                input_sample_rate: INPUT_SAMPLE_RATE,
                output_sample_rate: OUTPUT_SAMPLE_RATE,
                channels: 1,
                frame_size: crate::audio::capture::DEFAULT_FRAME_SIZE,
                analyser_fft_size: crate::audio::analyser::DEFAULT_FFT_SIZE,
            },
            devices: DevicesConfig {
                input: if native { "native" } else { "answer.wav" }.to_string(),
                output: if native { "native" } else { "null" }.to_string(),
            },
            exam: ExamSettings {
                examiner_style: "A strict but fair university professor".to_string(),
                language: "English".to_string(),
                difficulty: "medium".to_string(),
                total_questions: 5,
                syllabus_path: "syllabus.txt".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_EXAM_LANGUAGE=Spanish`: Override the exam language
    /// - `APP_ENDPOINT_URL=ws://localhost:9000`: Talk to a local endpoint
    /// - `GEMINI_API_KEY=...` or `API_KEY=...`: API key
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Multi-word keys do not survive the `_` separator, so the key has its own names
        for var in ["API_KEY", "GEMINI_API_KEY"] {
            if let Ok(key) = env::var(var) {
                settings = settings.set_override("endpoint.api_key", key)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        let url = &self.endpoint.url;
        if url.is_empty() {
            return Err(anyhow::anyhow!("Endpoint URL cannot be empty"));
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(anyhow::anyhow!("Endpoint URL must be ws:// or wss://, got {}", url));
        }

        if self.audio.input_sample_rate != INPUT_SAMPLE_RATE {
            return Err(anyhow::anyhow!(
                "Input sample rate must be {} Hz",
                INPUT_SAMPLE_RATE
            ));
        }
        if self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Output sample rate must be greater than 0"));
        }
        if self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Channel count must be greater than 0"));
        }
        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Frame size must be greater than 0"));
        }
        let fft = self.audio.analyser_fft_size;
        if !fft.is_power_of_two() || !(32..=32768).contains(&fft) {
            return Err(anyhow::anyhow!(
                "Analyser FFT size must be a power of two between 32 and 32768"
            ));
        }

        if self.exam.total_questions == 0 {
            return Err(anyhow::anyhow!("Exam must have at least one question"));
        }

        Ok(())
    }

    /// Engine parameters for the session controller.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            voice: self.endpoint.voice.clone(),
            frame_size: self.audio.frame_size,
            output_sample_rate: self.audio.output_sample_rate,
            output_channels: self.audio.channels,
            analyser_fft_size: self.audio.analyser_fft_size,
        }
    }

    /// Build the exam description around an already-read syllabus.
    pub fn exam_config(&self, syllabus: &str) -> SessionResult<ExamSessionConfig> {
        ExamSessionConfig::new(
            self.exam.examiner_style.clone(),
            syllabus,
            self.exam.language.clone(),
            self.exam.difficulty.clone(),
            self.exam.total_questions,
        )
    }
}
