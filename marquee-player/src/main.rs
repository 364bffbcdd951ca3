//! # Marquee Player
//!
//! Headless driver for marquee-core: opens a clip, plays it against an
//! in-memory surface and reports how the video kept up.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use marquee_core::{
    decoder_list, set_current_decoder, AudioSource, FsResolver, MediaConfig, MediaKind,
    MediaSession, MemorySurface, UniversalBackend,
};

/// Surface refresh rate of the driver loop.
const TICK_HZ: u64 = 60;

struct PlayerOptions {
    input: String,
    archive: String,
    seconds: Option<f64>,
    decoder: Option<String>,
    config: Option<String>,
    list_decoders: bool,
    looping: bool,
    kind: MediaKind,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("marquee_player=info,marquee_core=info")
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    tracing::info!("Marquee Player v{}", marquee_core::VERSION);

    let backend = Arc::new(UniversalBackend::default());
    if options.list_decoders {
        for name in decoder_list(backend.as_ref()) {
            println!("{}", name);
        }
        return Ok(());
    }

    if let Some(decoder) = &options.decoder {
        set_current_decoder(decoder);
    }
    let mut config = match &options.config {
        Some(path) => MediaConfig::load(path)?,
        None => MediaConfig::default(),
    };
    configure_output(&mut config);

    let mut session = MediaSession::with_config(options.kind, backend, config);
    session.set_loop(options.looping);
    let surface = MemorySurface::native();
    session.open(
        &FsResolver::new(),
        &options.archive,
        &options.input,
        Some(Box::new(surface.clone())),
    )?;

    tracing::info!(
        "{}: duration {:?}, aspect {:.3}, audio {}, video {}",
        options.input,
        session.get_duration(),
        session.get_aspect_ratio(),
        session.has_audio(),
        session.has_video()
    );
    if let Some(title) = session.get_metadata("title") {
        tracing::info!("Title: {}", title);
    }

    let sink = session.audio_source().map(AudioSink::start).transpose()?;
    session.play()?;

    let limit = options.seconds.map(Duration::from_secs_f64);
    let started = Instant::now();
    let tick = Duration::from_micros(1_000_000 / TICK_HZ);
    while !session.is_finished() {
        session.tick();
        if limit.map_or(false, |l| started.elapsed() >= l) {
            tracing::info!("Time limit reached");
            break;
        }
        if let Some(err) = session.last_error() {
            tracing::error!("Playback aborted: {}", err);
            break;
        }
        thread::sleep(tick);
    }
    session.tick();

    tracing::info!(
        "Playback complete: position {:?}, surface updates {}, wall {:?}",
        session.get_video_time(),
        surface.updates(),
        started.elapsed()
    );
    if let Some(stats) = session.video_stats() {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }

    session.close();
    drop(sink);
    Ok(())
}

#[cfg(feature = "audio")]
fn configure_output(config: &mut MediaConfig) {
    match marquee_core::CpalOutput::default_spec() {
        Ok(spec) => config.audio_output = spec,
        Err(e) => tracing::warn!("No audio device, keeping {:?}: {}", config.audio_output, e),
    }
}

#[cfg(not(feature = "audio"))]
fn configure_output(_config: &mut MediaConfig) {}

/// Consumes the session's audio, either through the sound device or by
/// pulling it in real time and discarding it.
enum AudioSink {
    #[cfg(feature = "audio")]
    Device(marquee_core::CpalOutput),
    Null {
        done: Arc<AtomicBool>,
        handle: Option<thread::JoinHandle<()>>,
    },
}

impl AudioSink {
    #[cfg(feature = "audio")]
    fn start(source: AudioSource) -> Result<Self> {
        Ok(AudioSink::Device(marquee_core::CpalOutput::start(source)?))
    }

    #[cfg(not(feature = "audio"))]
    fn start(source: AudioSource) -> Result<Self> {
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let handle = thread::Builder::new()
            .name("marquee-null-audio".into())
            .spawn(move || null_sink(source, &flag))?;
        Ok(AudioSink::Null {
            done,
            handle: Some(handle),
        })
    }
}

impl Drop for AudioSink {
    fn drop(&mut self) {
        if let AudioSink::Null { done, handle } = self {
            done.store(true, Ordering::Relaxed);
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Pull 10 ms blocks at the output rate until told to quit.
fn null_sink(source: AudioSource, done: &AtomicBool) {
    let spec = source.spec();
    let block = (spec.sample_rate as usize / 100).max(1) * spec.channels.max(1) as usize;
    let mut buffer = vec![0i16; block];
    while !done.load(Ordering::Relaxed) {
        match source.produce(&mut buffer) {
            Ok(produced) if produced.finished => break,
            Ok(_) => {}
            Err(e) => {
                tracing::error!("Audio stopped: {}", e);
                break;
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn parse_args(args: &[String]) -> Result<PlayerOptions> {
    let mut input: Option<String> = None;
    let mut archive = String::new();
    let mut seconds = None;
    let mut decoder = None;
    let mut config = None;
    let mut list_decoders = false;
    let mut looping = false;
    let mut kind = MediaKind::AudioVideo;

    let mut i = 1;
    while i < args.len() {
        let value = || {
            args.get(i + 1)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("Missing value for {}", args[i]))
        };
        match args[i].as_str() {
            "--input" | "-i" => {
                input = Some(value()?);
                i += 2;
            }
            "--archive" | "-a" => {
                archive = value()?;
                i += 2;
            }
            "--seconds" | "-s" => {
                let v = value()?;
                seconds = Some(
                    v.parse::<f64>()
                        .map_err(|e| anyhow::anyhow!("Invalid seconds {}: {}", v, e))?,
                );
                i += 2;
            }
            "--decoder" => {
                decoder = Some(value()?);
                i += 2;
            }
            "--config" => {
                config = Some(value()?);
                i += 2;
            }
            "--kind" => {
                let v = value()?;
                kind = match v.as_str() {
                    "audio" => MediaKind::Audio,
                    "video" => MediaKind::Video,
                    "av" | "audio-video" => MediaKind::AudioVideo,
                    _ => return Err(anyhow::anyhow!("Unknown media kind {}", v)),
                };
                i += 2;
            }
            "--list-decoders" => {
                list_decoders = true;
                i += 1;
            }
            "--loop" => {
                looping = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    let input = match input {
        Some(input) => input,
        None if list_decoders => String::new(),
        None => {
            print_usage();
            return Err(anyhow::anyhow!("Missing required --input"));
        }
    };

    Ok(PlayerOptions {
        input,
        archive,
        seconds,
        decoder,
        config,
        list_decoders,
        looping,
        kind,
    })
}

fn print_usage() {
    println!("Usage: marquee --input <file> [options]");
    println!("  -i, --input <name>     Media file (or entry name inside --archive)");
    println!("  -a, --archive <path>   Directory or ZIP archive holding the media");
    println!("  -s, --seconds <secs>   Stop after this much wall time");
    println!("      --decoder <name>   Preferred video decoder");
    println!("      --kind <k>         audio | video | av (default av)");
    println!("      --config <file>    JSON engine configuration");
    println!("      --loop             Restart at the end (use with --seconds)");
    println!("      --list-decoders    Print available decoders and exit");
}
