use anyhow::Result;
use clap::{Parser, Subcommand};
use gibber_wave_core::{
    audio::{list_audio_devices, CpalHost},
    gateway::{AudioDeviceGateway, CaptureConstraints},
    protocol::Framer,
    Config,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gibber-wave")]
#[command(about = "Data-over-sound transceiver diagnostics", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available audio devices
    Devices,

    /// Open the audio session and microphone the way the transceiver does
    Probe {
        /// Preferred session sample rate in Hz
        #[arg(long, default_value = "48000")]
        sample_rate: u32,

        /// How long to capture from the microphone, in milliseconds
        #[arg(long, default_value = "1000")]
        capture_ms: u64,

        /// Capture frame size in samples
        #[arg(long, default_value = "1024")]
        frame_size: usize,
    },
}

#[derive(Default)]
struct CaptureStats {
    frames: usize,
    peak: f32,
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => {
            let devices = list_audio_devices();
            println!("Available audio devices:");
            for device in devices {
                println!("  {}", device);
            }
        }

        Commands::Probe {
            sample_rate,
            capture_ms,
            frame_size,
        } => {
            let config = Config {
                preferred_sample_rate: sample_rate,
                frame_size,
                ..Default::default()
            };
            probe(&config, Duration::from_millis(capture_ms))?;
        }
    }

    Ok(())
}

fn probe(config: &Config, capture_for: Duration) -> Result<()> {
    let gateway = AudioDeviceGateway::new(
        Box::new(CpalHost),
        config.preferred_sample_rate,
        config.device_rate_wait,
    );

    let session = gateway.ensure_session()?;
    let sink = gateway.output_sink()?;
    println!("Session: {} Hz, {}", session.sample_rate, session.state);
    println!("Output:  {} ({} ch)", sink.name, sink.channels);

    let stats = Arc::new(Mutex::new(CaptureStats::default()));
    let stats_clone = Arc::clone(&stats);
    let mut framer = Framer::new(config.frame_size);

    let mut handle = gateway.open_capture(
        &CaptureConstraints::raw(),
        Box::new(move |samples: &[f32]| {
            framer.push(samples, |frame| {
                if let Ok(mut stats) = stats_clone.try_lock() {
                    stats.frames += 1;
                    stats.peak = frame.iter().fold(stats.peak, |a, &b| a.max(b.abs()));
                }
            });
        }),
    )?;

    println!("Capturing for {} ms...", capture_for.as_millis());
    std::thread::sleep(capture_for);
    gateway.close_capture(&mut handle);

    let stats = stats.lock().map_err(|_| anyhow::anyhow!("capture stats poisoned"))?;
    println!(
        "Captured {} frames of {} samples, peak amplitude {:.3}",
        stats.frames, config.frame_size, stats.peak
    );

    gateway.close();
    Ok(())
}
