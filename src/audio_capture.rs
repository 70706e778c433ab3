//! Microphone capture using cpal.
//!
//! Each opened microphone runs its input stream on a dedicated thread and
//! pushes float samples into a [`MicStream`]. Stopping the stream sends the
//! thread a stop command, which drops the cpal stream and releases the device.

use crate::audio_graph::{AudioBackend, AudioGraphError, MicConstraints, MicStream, OutputDevice};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

enum CaptureCommand {
    Stop,
}

/// Capture backend on the default cpal host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    fn find_input_device(name: Option<&str>) -> Result<cpal::Device, AudioGraphError> {
        let host = cpal::default_host();
        match name {
            Some(name) => host
                .input_devices()
                .map_err(|e| AudioGraphError::MicUnavailable(e.to_string()))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| AudioGraphError::MicUnavailable(format!("input device not found: {}", name))),
            None => host
                .default_input_device()
                .ok_or_else(|| AudioGraphError::MicUnavailable("no input device available".into())),
        }
    }
}

impl AudioBackend for CpalBackend {
    fn create_context(&self) -> Result<(), AudioGraphError> {
        let host = cpal::default_host();
        if host.default_input_device().is_none() && host.default_output_device().is_none() {
            return Err(AudioGraphError::ContextUnavailable(format!(
                "no audio devices on host {:?}",
                host.id()
            )));
        }
        Ok(())
    }

    fn open_microphone(&self, constraints: &MicConstraints) -> Result<MicStream, AudioGraphError> {
        let device = Self::find_input_device(constraints.device_name.as_deref())?;
        let label = device.name().unwrap_or_else(|_| "microphone".to_string());

        let config = device
            .default_input_config()
            .map_err(|e| AudioGraphError::DeviceConfig(e.to_string()))?;

        log::info!(
            "Capture: {} at {} Hz, {} channels, {:?}",
            label,
            config.sample_rate().0,
            config.channels(),
            config.sample_format()
        );
        if constraints.echo_cancellation || constraints.noise_suppression || constraints.auto_gain_control {
            log::debug!("Capture: processing hints are left to the platform input chain");
        }

        let stream = MicStream::new(label, config.sample_rate().0, config.channels());
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let sample_format = config.sample_format();
        let stream_config: cpal::StreamConfig = config.into();
        let target = stream.clone();

        thread::spawn(move || {
            if let Err(e) = run_capture_thread(device, stream_config, sample_format, target.clone(), command_rx, ready_tx)
            {
                target.mark_ended(&e.to_string());
            }
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(AudioGraphError::StreamStart(
                    "capture thread exited before starting".into(),
                ))
            }
        }

        Ok(stream.with_stop_hook(move || {
            let _ = command_tx.send(CaptureCommand::Stop);
        }))
    }

    fn output_devices(&self) -> Vec<OutputDevice> {
        let host = cpal::default_host();
        host.output_devices()
            .map(|devices| {
                devices
                    .filter_map(|d| d.name().ok())
                    .map(|name| OutputDevice {
                        id: name.clone(),
                        label: name,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Run the input stream in a dedicated thread until told to stop.
fn run_capture_thread(
    device: cpal::Device,
    config: cpal::StreamConfig,
    sample_format: SampleFormat,
    target: MicStream,
    command_rx: mpsc::Receiver<CaptureCommand>,
    ready_tx: mpsc::Sender<Result<(), AudioGraphError>>,
) -> Result<(), AudioGraphError> {
    use cpal::Sample;

    let err_target = target.clone();
    let err_fn = move |err: cpal::StreamError| {
        log::error!("Audio stream error: {}", err);
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            err_target.mark_ended("device not available");
        }
    };

    let built = match sample_format {
        SampleFormat::F32 => {
            let target = target.clone();
            device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| target.push_samples(data),
                err_fn,
                None,
            )
        }
        SampleFormat::I16 => {
            let target = target.clone();
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let samples: Vec<f32> = data.iter().map(|&s| s.to_float_sample()).collect();
                    target.push_samples(&samples);
                },
                err_fn,
                None,
            )
        }
        SampleFormat::U16 => {
            let target = target.clone();
            device.build_input_stream(
                &config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    let samples: Vec<f32> = data.iter().map(|&s| s.to_float_sample()).collect();
                    target.push_samples(&samples);
                },
                err_fn,
                None,
            )
        }
        _ => {
            let e = AudioGraphError::DeviceConfig(format!("Unsupported sample format: {:?}", sample_format));
            let _ = ready_tx.send(Err(e.clone()));
            return Err(e);
        }
    };

    let stream = match built {
        Ok(stream) => stream,
        Err(e) => {
            // Permission refusals surface here on most platforms.
            let e = AudioGraphError::MicUnavailable(e.to_string());
            let _ = ready_tx.send(Err(e.clone()));
            return Err(e);
        }
    };

    if let Err(e) = stream.play() {
        let e = AudioGraphError::StreamStart(e.to_string());
        let _ = ready_tx.send(Err(e.clone()));
        return Err(e);
    }
    let _ = ready_tx.send(Ok(()));

    // Wait for stop command
    loop {
        match command_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(CaptureCommand::Stop) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if !target.is_live() {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    // Stream is dropped here, stopping capture
    log::debug!("Capture: input stream for {} released", target.label());
    Ok(())
}

/// Names of the available input devices.
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    host.input_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}
