//! roger-aout 演示程序
//!
//! 把文件或测试音通过空设备播放出去，用来观察推/拉两种调度下的
//! 缓冲、延迟和 underrun 行为。

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use roger_aout::audio::{OutputLayout, SampleFormat};
use roger_aout::decode::{AudioDecoder, SampleSource, ToneSource};
use roger_aout::driver::null::{NullCallbackDriver, NullConfig, NullDriver};
use roger_aout::engine::{Engine, EngineConfig, PlaybackState};
use roger_aout::output::{Backend, OutputConfig};

/// Audio output scheduling demo
#[derive(Parser)]
#[command(name = "roger-aout")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use the callback (pull) device instead of the feeder-thread (push) device
    #[arg(long, global = true)]
    pull: bool,

    /// Software buffer size in milliseconds
    #[arg(short, long, default_value = "200", global = true)]
    buffer_ms: u64,

    /// Simulated device buffer size in milliseconds
    #[arg(long, default_value = "100", global = true)]
    device_buffer_ms: u64,

    /// Extra simulated output latency in milliseconds
    #[arg(long, default_value = "0", global = true)]
    latency_ms: u64,

    /// Emulate pause on the device instead of pausing natively
    #[arg(long, global = true)]
    no_native_pause: bool,

    /// Use non-interleaved (planar) output
    #[arg(long, global = true)]
    planar: bool,

    /// Output 32-bit float samples
    #[arg(long, global = true)]
    float: bool,

    /// Keep the device running and feed silence when idle or paused
    #[arg(long, global = true)]
    stream_silence: bool,

    /// Random producer stall after each write, up to this many milliseconds
    #[arg(long, default_value = "0", global = true)]
    jitter_ms: u64,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode and play an audio file
    Play {
        /// Audio file to play
        file: PathBuf,
    },

    /// Play a sine test tone
    Tone {
        /// Frequency in Hz
        #[arg(long, default_value = "440")]
        freq: f64,

        /// Duration in seconds
        #[arg(long, default_value = "3")]
        secs: f64,

        #[arg(long, default_value = "48000")]
        rate: u32,

        #[arg(long, default_value = "2")]
        channels: u16,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    let source: Box<dyn SampleSource> = match cli.command {
        Commands::Play { ref file } => {
            println!("roger-aout - Loading: {}", file.display());
            Box::new(AudioDecoder::open(file)?)
        }
        Commands::Tone {
            freq,
            secs,
            rate,
            channels,
        } => {
            println!("roger-aout - Tone: {} Hz, {:.1}s", freq, secs);
            Box::new(ToneSource::new(rate, channels, freq, 0.5, secs))
        }
    };

    run(source, &cli)
}

fn create_engine_config(cli: &Cli) -> EngineConfig {
    EngineConfig {
        output: OutputConfig {
            buffer_ms: cli.buffer_ms,
            stream_silence: cli.stream_silence,
            ..Default::default()
        },
        layout: if cli.planar {
            OutputLayout::NonInterleaved
        } else {
            OutputLayout::Interleaved
        },
        sample_format: cli.float.then_some(SampleFormat::F32),
        jitter_ms: cli.jitter_ms,
        ..Default::default()
    }
}

fn create_backend(cli: &Cli) -> Backend {
    let config = NullConfig {
        buffer_ms: cli.device_buffer_ms,
        latency_ms: cli.latency_ms,
        native_pause: !cli.no_native_pause,
        ..Default::default()
    };

    if cli.pull {
        Backend::Pull(Box::new(NullCallbackDriver::new(config)))
    } else {
        Backend::Push(Box::new(NullDriver::new(config)))
    }
}

fn run(source: Box<dyn SampleSource>, cli: &Cli) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut engine = Engine::new(create_engine_config(cli));
    engine.start(source, create_backend(cli))?;

    let mode = if cli.pull { "pull (callback)" } else { "push (feeder thread)" };
    println!("Output: null device, {} mode", mode);
    println!("Playing. Press Ctrl+C to stop.\n");

    let total_secs = engine
        .current_info()
        .and_then(|i| i.duration_secs)
        .unwrap_or(0.0);

    let mut interrupted = false;
    while !engine.is_finished() {
        if !running.load(Ordering::SeqCst) {
            interrupted = true;
            break;
        }

        let stats = engine.stats();
        let state = match engine.state() {
            PlaybackState::Draining => "draining",
            PlaybackState::Paused => "paused",
            _ => "playing",
        };
        print!(
            "\r  {:02}:{:05.2} / {:02}:{:05.2}  |  Delay: {:6.1} ms  |  Underruns: {}  |  {:<8}",
            (stats.position_secs / 60.0) as u32,
            stats.position_secs % 60.0,
            (total_secs / 60.0) as u32,
            total_secs % 60.0,
            stats.delay_secs * 1000.0,
            stats.underrun_count,
            state
        );
        io::stdout().flush()?;
        std::thread::sleep(Duration::from_millis(100));
    }
    println!();

    let report = if interrupted {
        println!("Stopping...");
        engine.stop()
    } else {
        engine.wait()
    };

    if let Some(report) = report {
        println!("\n{}", report);
    }

    Ok(())
}
