//! Speaker output through rodio.
//!
//! The output stream lives on a dedicated thread (dropping it stops all
//! audio). Playbacks attach to its mixer through `rodio::Sink`s, so they can
//! be stopped, muted and fed incrementally from any thread. Rerouting opens a
//! new stream; playbacks attached to the old one count as finished.

use crate::playback::{ActivePlayback, PlaybackError, PlaybackSink};
use crate::recorder::{decode_pcm16, AudioBlob, PcmFormat};
use rodio::buffer::SamplesBuffer;
use rodio::cpal::traits::{DeviceTrait, HostTrait};
use rodio::mixer::Mixer;
use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

struct OutputThread {
    mixer: Mixer,
    device: Option<String>,
    shutdown: mpsc::Sender<()>,
}

impl Drop for OutputThread {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Which output stream a playback is attached to.
#[derive(Clone)]
struct Attachment {
    current: Arc<AtomicU64>,
    opened_on: u64,
}

impl Attachment {
    /// The stream this playback was feeding has been replaced.
    fn is_detached(&self) -> bool {
        self.current.load(Ordering::SeqCst) != self.opened_on
    }
}

fn volume(muted: bool) -> f32 {
    if muted {
        0.0
    } else {
        1.0
    }
}

fn is_named(device: &str, wanted: &str) -> bool {
    device.trim().eq_ignore_ascii_case(wanted.trim())
}

/// Join the carried byte with `chunk` and hold back a trailing odd byte, so
/// 16-bit samples split across network chunks decode intact.
fn whole_samples(carry: &mut Option<u8>, chunk: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(chunk.len() + 1);
    bytes.extend(carry.take());
    bytes.extend_from_slice(chunk);
    if bytes.len() % 2 == 1 {
        *carry = bytes.pop();
    }
    bytes
}

fn open_stream(device_name: Option<&str>) -> Result<OutputStream, PlaybackError> {
    let Some(name) = device_name else {
        return OutputStreamBuilder::open_default_stream().map_err(|e| PlaybackError::Output(e.to_string()));
    };

    let host = rodio::cpal::default_host();
    let device = host
        .output_devices()
        .map_err(|e| PlaybackError::Output(e.to_string()))?
        .find(|d| d.name().map(|n| is_named(&n, name)).unwrap_or(false))
        .ok_or_else(|| PlaybackError::DeviceNotFound(name.to_string()))?;

    OutputStreamBuilder::from_device(device)
        .map_err(|e| PlaybackError::Output(e.to_string()))?
        .open_stream()
        .map_err(|e| PlaybackError::Output(e.to_string()))
}

fn spawn_output(device_name: Option<String>) -> Result<OutputThread, PlaybackError> {
    let (ready_tx, ready_rx) = mpsc::channel();
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let thread_device = device_name.clone();

    thread::spawn(move || {
        let stream = match open_stream(thread_device.as_deref()) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        let _ = ready_tx.send(Ok(stream.mixer().clone()));

        // Hold the stream until shutdown (or the sink is dropped).
        let _ = shutdown_rx.recv();
        drop(stream);
    });

    let mixer = ready_rx
        .recv()
        .map_err(|_| PlaybackError::Output("output thread exited before opening a stream".into()))??;

    log::info!(
        "Output: stream opened on {}",
        device_name.as_deref().unwrap_or("default device")
    );

    Ok(OutputThread {
        mixer,
        device: device_name,
        shutdown: shutdown_tx,
    })
}

/// Playback sink on the system audio output.
pub struct RodioSink {
    output: Mutex<OutputThread>,
    muted: AtomicBool,
    generation: Arc<AtomicU64>,
}

impl RodioSink {
    /// Open the named output device, or the default one.
    pub fn open(device_name: Option<&str>) -> Result<Self, PlaybackError> {
        Ok(Self {
            output: Mutex::new(spawn_output(device_name.map(str::to_string))?),
            muted: AtomicBool::new(false),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn device(&self) -> Option<String> {
        self.output.lock().ok().and_then(|o| o.device.clone())
    }

    fn new_sink(&self) -> Result<(Sink, Attachment), PlaybackError> {
        let output = self
            .output
            .lock()
            .map_err(|_| PlaybackError::Output("output lock poisoned".into()))?;
        let sink = Sink::connect_new(&output.mixer);
        sink.set_volume(volume(self.muted.load(Ordering::SeqCst)));
        let attachment = Attachment {
            current: self.generation.clone(),
            opened_on: self.generation.load(Ordering::SeqCst),
        };
        Ok((sink, attachment))
    }
}

impl PlaybackSink for RodioSink {
    fn play_buffered(&self, blob: &AudioBlob) -> Result<Box<dyn ActivePlayback>, PlaybackError> {
        let (sink, attachment) = self.new_sink()?;

        match blob.pcm_format() {
            Some(format) => {
                let samples = decode_pcm16(blob.bytes());
                sink.append(SamplesBuffer::new(format.channels, format.sample_rate, samples));
            }
            None => {
                let decoded = Decoder::new(Cursor::new(blob.bytes().to_vec())).map_err(|e| PlaybackError::Decode {
                    mime: blob.mime_type().to_string(),
                    reason: e.to_string(),
                })?;
                sink.append(decoded);
            }
        }

        Ok(Box::new(RodioPlayback {
            sink,
            attachment,
            pcm: None,
            carry: None,
            ended: true,
        }))
    }

    fn supports_progressive(&self, mime: &str) -> bool {
        PcmFormat::parse(mime).is_some()
    }

    fn open_progressive(&self, mime: &str) -> Result<Box<dyn ActivePlayback>, PlaybackError> {
        let format = PcmFormat::parse(mime).ok_or(PlaybackError::NotProgressive)?;
        let (sink, attachment) = self.new_sink()?;
        Ok(Box::new(RodioPlayback {
            sink,
            attachment,
            pcm: Some(format),
            carry: None,
            ended: false,
        }))
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    /// Subsequent playbacks use the new device. Audio already playing on the
    /// old one stops with it and reports itself finished.
    fn route_to(&self, device_id: &str) -> Result<(), PlaybackError> {
        if self.device().as_deref() == Some(device_id) {
            return Ok(());
        }
        let replacement = spawn_output(Some(device_id.to_string()))?;
        let mut output = self
            .output
            .lock()
            .map_err(|_| PlaybackError::Output("output lock poisoned".into()))?;
        *output = replacement;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct RodioPlayback {
    sink: Sink,
    attachment: Attachment,
    pcm: Option<PcmFormat>,
    /// Odd trailing byte of the previous chunk.
    carry: Option<u8>,
    ended: bool,
}

impl ActivePlayback for RodioPlayback {
    fn is_finished(&self) -> bool {
        self.attachment.is_detached() || (self.ended && self.sink.empty())
    }

    fn stop(&mut self) {
        self.ended = true;
        self.sink.stop();
    }

    fn set_muted(&mut self, muted: bool) {
        self.sink.set_volume(volume(muted));
    }

    fn append(&mut self, chunk: &[u8]) -> Result<(), PlaybackError> {
        let format = self.pcm.ok_or(PlaybackError::NotProgressive)?;
        if self.attachment.is_detached() {
            return Err(PlaybackError::Output("output device changed".into()));
        }

        let bytes = whole_samples(&mut self.carry, chunk);
        if bytes.is_empty() {
            return Ok(());
        }

        self.sink
            .append(SamplesBuffer::new(format.channels, format.sample_rate, decode_pcm16(&bytes)));
        Ok(())
    }

    fn end_of_stream(&mut self) {
        self.ended = true;
    }
}
