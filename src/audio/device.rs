//! # Audio Devices
//!
//! Microphone and speaker backends used by the session engine.
//!
//! ## Backends:
//! - **WavMicrophone**: plays a 16 kHz WAV file into the capture sink at real-time
//!   pace, then keeps feeding silence until stopped
//! - **NullSpeaker**: accepts and times segments without producing sound
//! - **WavSpeaker**: renders the output timeline (including cancellations) to a WAV file
//! - **NativeMicrophone / NativeSpeaker**: system audio through `cpal`
//!   (feature `native-audio`)
//!
//! ## Threading:
//! Device callbacks run on their own threads and talk to the session only
//! through `CaptureSink`. `cpal` streams are not `Send`, so each native stream
//! lives on a dedicated thread that owns it until a stop signal arrives.
//! `stop` and `close` only signal those threads; joining them happens on the
//! blocking pool, never on the session task.

use crate::audio::capture::CaptureSink;
use crate::audio::codec::{PlaybackSegment, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::audio::scheduler::SegmentId;
use crate::error::{SessionError, SessionResult};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// PCM format tag in a WAV header.
const WAV_FORMAT_PCM: u16 = 1;

/// Source of captured audio.
pub trait Microphone: Send {
    /// Acquire the device and start delivering samples into `sink`.
    fn start(&mut self, sink: CaptureSink) -> SessionResult<()>;

    /// Stop capturing and release the device. Safe to call more than once.
    fn stop(&mut self);
}

/// Destination of scheduled speech.
pub trait Speaker: Send {
    /// Queue a segment to start at `start_at` seconds on the output clock.
    fn play(&mut self, id: SegmentId, segment: &PlaybackSegment, start_at: f64) -> SessionResult<()>;

    /// Cancel a segment from output time `at` onward.
    fn stop(&mut self, id: SegmentId, at: f64);

    /// Release the output device. Safe to call more than once.
    fn close(&mut self);
}

/// Join a device thread without holding up the caller.
///
/// Inside a tokio runtime the join moves to the blocking pool; outside one the
/// thread is joined in place.
fn reap(worker: JoinHandle<()>, name: &'static str) {
    let join = move || {
        if worker.join().is_err() {
            warn!("{} thread panicked", name);
        }
        debug!("{} thread joined", name);
    };
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(join);
        }
        Err(_) => join(),
    }
}

/// Build the microphone named by the `devices.input` setting.
pub fn open_microphone(spec: &str) -> SessionResult<Box<dyn Microphone>> {
    match spec {
        "native" => native_microphone(),
        path => Ok(Box::new(WavMicrophone::new(path))),
    }
}

/// Build the speaker named by the `devices.output` setting.
pub fn open_speaker(spec: &str) -> SessionResult<Box<dyn Speaker>> {
    match spec {
        "null" | "" => Ok(Box::new(NullSpeaker::default())),
        "native" => native_speaker(),
        path => Ok(Box::new(WavSpeaker::new(path, OUTPUT_SAMPLE_RATE))),
    }
}

#[cfg(feature = "native-audio")]
fn native_microphone() -> SessionResult<Box<dyn Microphone>> {
    Ok(Box::new(native::NativeMicrophone::new(INPUT_SAMPLE_RATE)))
}

#[cfg(not(feature = "native-audio"))]
fn native_microphone() -> SessionResult<Box<dyn Microphone>> {
    Err(SessionError::Config(
        "native input requires the `native-audio` feature".to_string(),
    ))
}

#[cfg(feature = "native-audio")]
fn native_speaker() -> SessionResult<Box<dyn Speaker>> {
    Ok(Box::new(native::NativeSpeaker::open(OUTPUT_SAMPLE_RATE)?))
}

#[cfg(not(feature = "native-audio"))]
fn native_speaker() -> SessionResult<Box<dyn Speaker>> {
    Err(SessionError::Config(
        "native output requires the `native-audio` feature".to_string(),
    ))
}

/// Read a WAV file as mono `f32` samples, returning `(samples, sample_rate)`.
pub fn read_wav_mono(path: &Path) -> SessionResult<(Vec<f32>, u32)> {
    let mut file = File::open(path)?;
    let (header, data) = wav::read(&mut file)?;
    let channels = header.channel_count.max(1) as usize;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(samples) => samples.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect(),
        wav::BitDepth::Sixteen(samples) => samples.iter().map(|&s| s as f32 / 32768.0).collect(),
        wav::BitDepth::TwentyFour(samples) => samples.iter().map(|&s| s as f32 / 8_388_608.0).collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => Vec::new(),
    };

    // Down-mix by taking the first channel
    let mono = interleaved.chunks(channels).map(|frame| frame[0]).collect();
    Ok((mono, header.sampling_rate))
}

/// Microphone backed by a WAV file, paced at real time.
pub struct WavMicrophone {
    path: PathBuf,
    block: usize,
    stop_flag: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl WavMicrophone {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            // 100 ms blocks, like a small device buffer
            block: (INPUT_SAMPLE_RATE / 10) as usize,
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl Microphone for WavMicrophone {
    fn start(&mut self, mut sink: CaptureSink) -> SessionResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let (samples, rate) = read_wav_mono(&self.path).map_err(|e| {
            SessionError::PermissionDenied(format!("cannot open {}: {}", self.path.display(), e))
        })?;
        if rate != INPUT_SAMPLE_RATE {
            return Err(SessionError::PermissionDenied(format!(
                "{} is {} Hz, expected {} Hz",
                self.path.display(),
                rate,
                INPUT_SAMPLE_RATE
            )));
        }

        info!(path = %self.path.display(), seconds = samples.len() as f64 / rate as f64, "WAV microphone started");

        let block = self.block;
        let period = Duration::from_secs_f64(block as f64 / rate as f64);
        let stop_flag = self.stop_flag.clone();
        stop_flag.store(false, Ordering::SeqCst);

        let worker = thread::Builder::new()
            .name("wav-microphone".to_string())
            .spawn(move || {
                let silence = vec![0.0f32; block];
                let mut offset = 0;
                let started = Instant::now();
                let mut blocks_sent: u32 = 0;

                while !stop_flag.load(Ordering::SeqCst) {
                    let chunk = if offset < samples.len() {
                        let end = (offset + block).min(samples.len());
                        let chunk = &samples[offset..end];
                        offset = end;
                        chunk
                    } else {
                        &silence[..]
                    };
                    if !sink.push(chunk) {
                        debug!("Capture sink closed, WAV microphone exiting");
                        break;
                    }

                    blocks_sent += 1;
                    let due = started + period * blocks_sent;
                    let now = Instant::now();
                    if due > now {
                        thread::sleep(due - now);
                    }
                }
            })?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            reap(worker, "WAV microphone");
            info!("WAV microphone stopped");
        }
    }
}

impl Drop for WavMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Speaker that produces no sound.
#[derive(Debug, Default)]
pub struct NullSpeaker {
    played: u64,
    stopped: u64,
    closed: bool,
}

impl Speaker for NullSpeaker {
    fn play(&mut self, id: SegmentId, segment: &PlaybackSegment, start_at: f64) -> SessionResult<()> {
        if self.closed {
            return Err(SessionError::Device("speaker closed".to_string()));
        }
        self.played += 1;
        debug!(id, start_at, duration = segment.duration(), played = self.played, "Segment scheduled (null output)");
        Ok(())
    }

    fn stop(&mut self, id: SegmentId, at: f64) {
        self.stopped += 1;
        debug!(id, at, "Segment stopped (null output)");
    }

    fn close(&mut self) {
        if !self.closed {
            debug!(played = self.played, stopped = self.stopped, "Null speaker closed");
        }
        self.closed = true;
    }
}

/// Speaker that renders the session's output timeline into a WAV file on close.
pub struct WavSpeaker {
    path: PathBuf,
    sample_rate: u32,
    timeline: Vec<f32>,
    /// Sample range each segment occupies on the timeline
    ranges: HashMap<SegmentId, (usize, usize)>,
    closed: bool,
}

impl WavSpeaker {
    pub fn new(path: impl Into<PathBuf>, sample_rate: u32) -> Self {
        Self {
            path: path.into(),
            sample_rate,
            timeline: Vec::new(),
            ranges: HashMap::new(),
            closed: false,
        }
    }

    fn sample_index(&self, at: f64) -> usize {
        (at.max(0.0) * self.sample_rate as f64).round() as usize
    }

    pub fn timeline(&self) -> &[f32] {
        &self.timeline
    }

    fn write_file(&self) -> SessionResult<()> {
        let header = wav::Header::new(WAV_FORMAT_PCM, 1, self.sample_rate, 16);
        let samples: Vec<i16> = crate::audio::codec::encode(&self.timeline)
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        let mut file = File::create(&self.path)?;
        wav::write(header, &wav::BitDepth::Sixteen(samples), &mut file)?;
        Ok(())
    }
}

impl Speaker for WavSpeaker {
    fn play(&mut self, id: SegmentId, segment: &PlaybackSegment, start_at: f64) -> SessionResult<()> {
        if self.closed {
            return Err(SessionError::Device("speaker closed".to_string()));
        }
        let start = self.sample_index(start_at);
        let samples = segment.samples();
        let end = start + samples.len();
        if self.timeline.len() < end {
            self.timeline.resize(end, 0.0);
        }
        for (slot, &s) in self.timeline[start..end].iter_mut().zip(samples) {
            *slot += s;
        }
        self.ranges.insert(id, (start, end));
        Ok(())
    }

    fn stop(&mut self, id: SegmentId, at: f64) {
        let Some((start, end)) = self.ranges.remove(&id) else {
            return;
        };
        let cut = self.sample_index(at).max(start).min(end);
        self.timeline[cut..end].iter_mut().for_each(|s| *s = 0.0);
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match self.write_file() {
            Ok(()) => info!(path = %self.path.display(), samples = self.timeline.len(), "Wrote speaker output"),
            Err(e) => warn!("Failed to write speaker output: {}", e),
        }
    }
}

#[cfg(feature = "native-audio")]
mod native {
    //! `cpal` backends. Each stream is owned by a thread that parks on a stop channel.

    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleRate, StreamConfig};
    use std::collections::BTreeMap;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Mutex;

    fn device_error(e: impl std::fmt::Display) -> SessionError {
        SessionError::Device(e.to_string())
    }

    pub struct NativeMicrophone {
        sample_rate: u32,
        stop_tx: Option<std_mpsc::Sender<()>>,
        worker: Option<JoinHandle<()>>,
    }

    impl NativeMicrophone {
        pub fn new(sample_rate: u32) -> Self {
            Self {
                sample_rate,
                stop_tx: None,
                worker: None,
            }
        }
    }

    impl Microphone for NativeMicrophone {
        fn start(&mut self, mut sink: CaptureSink) -> SessionResult<()> {
            if self.worker.is_some() {
                return Ok(());
            }
            let sample_rate = self.sample_rate;
            let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
            let (ready_tx, ready_rx) = std_mpsc::channel::<SessionResult<()>>();

            let worker = thread::Builder::new()
                .name("native-microphone".to_string())
                .spawn(move || {
                    let stream = (|| -> SessionResult<cpal::Stream> {
                        let device = cpal::default_host()
                            .default_input_device()
                            .ok_or_else(|| SessionError::PermissionDenied("no input device available".to_string()))?;
                        info!("Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));
                        let config = StreamConfig {
                            channels: 1,
                            sample_rate: SampleRate(sample_rate),
                            buffer_size: cpal::BufferSize::Default,
                        };
                        let stream = device
                            .build_input_stream(
                                &config,
                                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                                    sink.push(data);
                                },
                                |err| warn!("Input stream error: {}", err),
                                None,
                            )
                            .map_err(|e| SessionError::PermissionDenied(e.to_string()))?;
                        stream.play().map_err(|e| SessionError::PermissionDenied(e.to_string()))?;
                        Ok(stream)
                    })();

                    match stream {
                        Ok(stream) => {
                            let _ = ready_tx.send(Ok(()));
                            let _ = stop_rx.recv();
                            drop(stream);
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                        }
                    }
                })?;

            match ready_rx.recv() {
                Ok(Ok(())) => {
                    self.stop_tx = Some(stop_tx);
                    self.worker = Some(worker);
                    info!("Native microphone started");
                    Ok(())
                }
                Ok(Err(e)) => {
                    let _ = worker.join();
                    Err(e)
                }
                Err(_) => Err(SessionError::Device("input thread exited".to_string())),
            }
        }

        fn stop(&mut self) {
            if let Some(tx) = self.stop_tx.take() {
                let _ = tx.send(());
            }
            if let Some(worker) = self.worker.take() {
                reap(worker, "Native microphone");
                info!("Native microphone stopped");
            }
        }
    }

    impl Drop for NativeMicrophone {
        fn drop(&mut self) {
            self.stop();
        }
    }

    /// Segments waiting or playing, positioned in output samples.
    #[derive(Default)]
    struct Mixer {
        position: u64,
        segments: BTreeMap<SegmentId, (u64, Vec<f32>)>,
    }

    impl Mixer {
        fn next_sample(&mut self) -> f32 {
            let pos = self.position;
            let mut value = 0.0;
            self.segments.retain(|_, (start, samples)| {
                let end = *start + samples.len() as u64;
                if pos >= *start && pos < end {
                    value += samples[(pos - *start) as usize];
                }
                pos + 1 < end
            });
            self.position += 1;
            value.clamp(-1.0, 1.0)
        }
    }

    pub struct NativeSpeaker {
        sample_rate: u32,
        mixer: Arc<Mutex<Mixer>>,
        stop_tx: Option<std_mpsc::Sender<()>>,
        worker: Option<JoinHandle<()>>,
    }

    impl NativeSpeaker {
        pub fn open(sample_rate: u32) -> SessionResult<Self> {
            let mixer = Arc::new(Mutex::new(Mixer::default()));
            let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
            let (ready_tx, ready_rx) = std_mpsc::channel::<SessionResult<()>>();
            let callback_mixer = mixer.clone();

            let worker = thread::Builder::new()
                .name("native-speaker".to_string())
                .spawn(move || {
                    let stream = (|| -> SessionResult<cpal::Stream> {
                        let device = cpal::default_host()
                            .default_output_device()
                            .ok_or_else(|| device_error("no output device available"))?;
                        let channels = device.default_output_config().map_err(device_error)?.channels();
                        let config = StreamConfig {
                            channels,
                            sample_rate: SampleRate(sample_rate),
                            buffer_size: cpal::BufferSize::Default,
                        };
                        let stream = device
                            .build_output_stream(
                                &config,
                                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                                    let Ok(mut mixer) = callback_mixer.lock() else {
                                        return;
                                    };
                                    for frame in data.chunks_mut(channels as usize) {
                                        let value = mixer.next_sample();
                                        frame.iter_mut().for_each(|s| *s = value);
                                    }
                                },
                                |err| warn!("Output stream error: {}", err),
                                None,
                            )
                            .map_err(device_error)?;
                        stream.play().map_err(device_error)?;
                        Ok(stream)
                    })();

                    match stream {
                        Ok(stream) => {
                            let _ = ready_tx.send(Ok(()));
                            let _ = stop_rx.recv();
                            drop(stream);
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                        }
                    }
                })?;

            match ready_rx.recv() {
                Ok(Ok(())) => {
                    info!("Native speaker opened");
                    Ok(Self {
                        sample_rate,
                        mixer,
                        stop_tx: Some(stop_tx),
                        worker: Some(worker),
                    })
                }
                Ok(Err(e)) => {
                    let _ = worker.join();
                    Err(e)
                }
                Err(_) => Err(device_error("output thread exited")),
            }
        }

        fn to_samples(&self, at: f64) -> u64 {
            (at.max(0.0) * self.sample_rate as f64).round() as u64
        }
    }

    impl Speaker for NativeSpeaker {
        fn play(&mut self, id: SegmentId, segment: &PlaybackSegment, start_at: f64) -> SessionResult<()> {
            let start = self.to_samples(start_at);
            let mut mixer = self
                .mixer
                .lock()
                .map_err(|_| device_error("output mixer poisoned"))?;
            // A segment already late starts where the device is now
            let start = start.max(mixer.position);
            mixer.segments.insert(id, (start, segment.samples().to_vec()));
            Ok(())
        }

        fn stop(&mut self, id: SegmentId, _at: f64) {
            if let Ok(mut mixer) = self.mixer.lock() {
                mixer.segments.remove(&id);
            }
        }

        fn close(&mut self) {
            if let Some(tx) = self.stop_tx.take() {
                let _ = tx.send(());
            }
            if let Some(worker) = self.worker.take() {
                reap(worker, "Native speaker");
                info!("Native speaker closed");
            }
        }
    }

    impl Drop for NativeSpeaker {
        fn drop(&mut self) {
            self.close();
        }
    }
}

#[cfg(feature = "native-audio")]
pub use native::{NativeMicrophone, NativeSpeaker};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateSignal;

    fn open_signal() -> GateSignal {
        let signal = GateSignal::new();
        signal.publish(true);
        signal
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("exam-voice-{}-{}", std::process::id(), name))
    }

    fn write_tone(path: &Path, rate: u32, samples: usize) {
        let data: Vec<i16> = (0..samples).map(|i| ((i % 100) as i16 - 50) * 100).collect();
        let header = wav::Header::new(WAV_FORMAT_PCM, 1, rate, 16);
        let mut file = File::create(path).unwrap();
        wav::write(header, &wav::BitDepth::Sixteen(data), &mut file).unwrap();
    }

    #[test]
    fn test_missing_wav_is_permission_denied() {
        let mut mic = WavMicrophone::new(temp_path("does-not-exist.wav"));
        let (sink, _mailbox) = CaptureSink::channel(1024, open_signal());
        let err = mic.start(sink).unwrap_err();
        assert!(matches!(err, SessionError::PermissionDenied(_)));
    }

    #[test]
    fn test_wrong_rate_is_rejected() {
        let path = temp_path("rate.wav");
        write_tone(&path, 44_100, 441);
        let mut mic = WavMicrophone::new(&path);
        let (sink, _mailbox) = CaptureSink::channel(1024, open_signal());
        assert!(mic.start(sink).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_wav_microphone_delivers_frames() {
        let path = temp_path("mic.wav");
        write_tone(&path, INPUT_SAMPLE_RATE, 3200);
        let mut mic = WavMicrophone::new(&path);
        let (sink, mut mailbox) = CaptureSink::channel(800, open_signal());

        mic.start(sink).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), mailbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.samples.len(), 800);
        mic.stop();
        mic.stop();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_for_the_capture_thread() {
        let path = temp_path("slow-mic.wav");
        write_tone(&path, INPUT_SAMPLE_RATE, 3200);
        let mut mic = WavMicrophone::new(&path);
        // One block per two seconds keeps the thread asleep through `stop`
        mic.block = (INPUT_SAMPLE_RATE * 2) as usize;
        let (sink, mut mailbox) = CaptureSink::channel(800, open_signal());

        mic.start(sink).unwrap();
        tokio::time::timeout(Duration::from_secs(2), mailbox.recv())
            .await
            .unwrap()
            .unwrap();

        let stopping = Instant::now();
        mic.stop();
        assert!(stopping.elapsed() < Duration::from_millis(500));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_wav_speaker_cuts_stopped_segment() {
        let path = temp_path("speaker.wav");
        let mut speaker = WavSpeaker::new(&path, 10);
        let a = PlaybackSegment::mono(vec![0.5; 10], 10);
        let b = PlaybackSegment::mono(vec![0.25; 10], 10);

        speaker.play(1, &a, 0.0).unwrap();
        speaker.play(2, &b, 1.0).unwrap();
        speaker.stop(2, 1.5);

        let timeline = speaker.timeline();
        assert_eq!(timeline.len(), 20);
        assert_eq!(timeline[9], 0.5);
        assert_eq!(timeline[14], 0.25);
        assert!(timeline[15..].iter().all(|&s| s == 0.0));

        speaker.close();
        speaker.close();
        let (written, rate) = read_wav_mono(&path).unwrap();
        assert_eq!(rate, 10);
        assert_eq!(written.len(), 20);
        assert!(speaker.play(3, &a, 3.0).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_open_by_name() {
        assert!(open_speaker("null").is_ok());
        assert!(open_microphone("/tmp/some.wav").is_ok());
        #[cfg(not(feature = "native-audio"))]
        assert!(matches!(
            open_microphone("native").err(),
            Some(SessionError::Config(_))
        ));
    }
}
