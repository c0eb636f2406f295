mod cli;

use rangeplay::{probe_source, Config, Input, Player, PlayerEvent};
use rp_pipeline::PipelineSettings;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "rangeplay=debug,rp_core=debug,rp_media=debug,rp_source=debug,rp_pipeline=trace,reqwest=debug".to_string()
        } else {
            "rangeplay=info,rp_core=info,rp_media=info,rp_source=info,rp_pipeline=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Probe { input, json } => {
            let input = input.into_input().context("an input URL or --file is required")?;
            let config = Config::load_or_default(cli.config.as_deref());
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(probe(input, &config, json))
        }
        Commands::Play {
            input,
            frames,
            rate,
        } => {
            let input = input.into_input().context("an input URL or --file is required")?;
            let config = Config::load_or_default(cli.config.as_deref());
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(play(input, config, frames, rate))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("rangeplay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn probe(input: Input, config: &Config, json: bool) -> Result<()> {
    let source = input.open(&config.source).await?;
    let report = probe_source(source.as_ref(), config.pipeline.probe_window).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let meta = &report.metadata;
    println!("Input: {input}");
    println!(
        "Video: {} {}x{} (coded {}x{})",
        report.decoder.codec,
        meta.width(),
        meta.height(),
        report.decoder.coded_width,
        report.decoder.coded_height
    );
    println!("Duration: {:.3}s", meta.duration());
    println!("Frames: {} ({:.3} fps)", meta.total_frames(), meta.fps());
    println!("Keyframes: {}", report.keyframes);
    println!("Bitrate: {} bps", meta.bitrate());
    println!("Decoder config: {} bytes", report.decoder.description_len);
    match &report.audio {
        Some(audio) => println!(
            "Audio: {} {} Hz {}ch (not decoded)",
            audio.codec, audio.sample_rate, audio.channels
        ),
        None => println!("Audio: none"),
    }

    Ok(())
}

/// Why `play` stopped.
#[derive(Debug)]
enum Finish {
    Ended,
    FrameLimit,
    Failed(String),
}

async fn play(input: Input, config: Config, frames: Option<u64>, rate: f64) -> Result<()> {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let presented = Arc::new(AtomicU64::new(0));

    let sink_count = presented.clone();
    let sink_done = done_tx.clone();
    let mut player = Player::new(&config)?.with_sink(move || {
        let count = sink_count.clone();
        let done = sink_done.clone();
        Box::new(move |frame: rp_core::DecodedFrame| {
            let n = count.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::info!(
                index = frame.sample_index(),
                ts_us = frame.timestamp_us(),
                "Presented frame {n}"
            );
            if frames.is_some_and(|limit| n >= limit) {
                let _ = done.send(Finish::FrameLimit);
            }
        })
    });

    let tx = done_tx.clone();
    player.on(PlayerEvent::Ended, move |_| {
        let _ = tx.send(Finish::Ended);
    });
    let tx = done_tx.clone();
    player.on(PlayerEvent::Error, move |data| {
        let _ = tx.send(Finish::Failed(data.to_string()));
    });
    player.on(PlayerEvent::LoadedMetadata, |data| {
        tracing::info!("Metadata: {data}");
    });
    drop(done_tx);

    let source = input.open(&config.source).await?;
    player.load_source(source)?;
    if rate != 1.0 {
        player.set_playback_rate(rate)?;
    }
    player.play()?;

    let finish = tokio::select! {
        finish = done_rx.recv() => finish,
        _ = tokio::signal::ctrl_c() => None,
    };
    player.destroy().await;

    let count = presented.load(Ordering::Relaxed);
    match finish {
        Some(Finish::Ended) => println!("Playback ended after {count} frames"),
        Some(Finish::FrameLimit) => println!("Stopped after {count} frames"),
        Some(Finish::Failed(report)) => anyhow::bail!("Playback failed after {count} frames: {report}"),
        None => println!("Interrupted after {count} frames"),
    }
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let contents = std::fs::read_to_string(p)
                .with_context(|| format!("failed to read {}", p.display()))?;
            Config::from_json(&contents)?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    let settings = PipelineSettings::try_from(&config)?;
    let warnings = config.validate();

    println!("✓ Configuration is valid");
    println!("  Max buffer count: {}", settings.limits.max_buffer_count());
    println!("  Max video frames: {}", settings.limits.max_video_frame_count());
    println!("  Sample batch size: {}", settings.limits.sample_batch_size());
    println!("  Probe window: {} bytes", settings.probe_window);
    println!("  Request timeout: {}s", config.source.request_timeout_secs);
    println!("  Autoplay: {}", config.player.autoplay);
    println!("  Playback rate: {}", settings.playback_rate);
    for warning in &warnings {
        println!("  warning: {warning}");
    }

    Ok(())
}
