use callflow_engine::audio_capture::list_input_devices;
use callflow_engine::{
    init_logging, AudioBackend, AudioGraphManager, CallEvent, CallOrchestrator, CpalBackend, EngineSettings, HttpBackend,
    NoRecognizer, RodioSink,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Place a voice call with the AI assistant", long_about = None)]
struct Args {
    /// Settings file (JSON). Defaults are used when omitted. A generated device id is saved back to it.
    #[arg(long, short)]
    settings: Option<PathBuf>,

    /// Input device name
    #[arg(long)]
    input_device: Option<String>,

    /// Output device name
    #[arg(long)]
    output_device: Option<String>,

    /// Start with the speaker muted
    #[arg(long)]
    speaker_muted: bool,

    /// List input and output devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() {
    init_logging();
    let args = Args::parse();

    if args.list_devices {
        print_devices();
        return;
    }

    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    let sink = match RodioSink::open(settings.playback.output_device.as_deref()) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            eprintln!("Failed to open audio output: {}", e);
            std::process::exit(1);
        }
    };
    let backend = match HttpBackend::new(&settings.backend) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let graph = Arc::new(AudioGraphManager::new(Arc::new(CpalBackend::new()), sink));
    let orchestrator = CallOrchestrator::new(settings, graph, Arc::new(NoRecognizer), backend);
    if args.speaker_muted {
        orchestrator.set_speaker_muted(true);
    }
    orchestrator.prepare_greeting();

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CallEvent::Status(text) => println!("[status] {}", text),
                CallEvent::AssistantCaption(caption) if caption.is_final => println!("[ai] {}", caption.text),
                CallEvent::UserCaption { text, is_final: true } => println!("[you] {}", text),
                CallEvent::Error { message, .. } => log::warn!("{}", message),
                _ => {}
            }
        }
    });

    let hangup = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            hangup.end_call();
        }
    });

    match orchestrator.start_call().await {
        Ok(report) => {
            println!(
                "Call {} ended after {} ({:?}): {} turns, {} replies completed, {} interrupted",
                report.call_id,
                callflow_engine::session::format_elapsed(report.duration.num_seconds()),
                report.ended_reason,
                report.turns_recorded,
                report.ai_turns_completed,
                report.ai_turns_interrupted
            );
        }
        Err(e) => {
            eprintln!("Call failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn load_settings(args: &Args) -> Result<EngineSettings, callflow_engine::SettingsError> {
    let mut settings = match &args.settings {
        Some(path) => EngineSettings::load(path)?,
        None => EngineSettings::from_env(),
    };
    if let Some(name) = &args.input_device {
        settings.recorder.input_device_name = Some(name.clone());
    }
    if let Some(name) = &args.output_device {
        settings.playback.output_device = Some(name.clone());
    }
    settings.validate()?;
    Ok(settings)
}

fn print_devices() {
    println!("Input devices:");
    for name in list_input_devices() {
        println!("  {}", name);
    }
    println!("Output devices:");
    for device in CpalBackend::new().output_devices() {
        println!("  {}", device.label);
    }
}
