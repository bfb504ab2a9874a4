use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use clap::{Arg, Command, value_parser};
use log::{debug, info};
use tokio::sync::mpsc;

use pipeflow::config::{EncodeConfig, app_name, version};
use pipeflow::encoder::{
    Arbiter, Control, EncodeRunner, EncodeStage, OutputEvent, PassthroughEngine, StageInput,
};
use pipeflow::pipeline::{
    CLOCK_FREQ, FlowDescriptor, Frame, FrameClock, PictureFlow, PipelineCoordinator, PixelFormat,
    Probe, Rational, SampleFormat, SoundFlow,
};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;
const FPS: u64 = 25;
const SAMPLE_RATE: u64 = 48_000;
const CHANNELS: u8 = 2;

/// Upstream chunk sizes in samples, deliberately unrelated to the engine frame size
const CHUNK_SAMPLES: [u64; 5] = [480, 500, 1024, 37, 960];

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("kind")
                .short('k')
                .long("kind")
                .value_name("KIND")
                .help("Media kind fed to the stages (audio/video).")
                .value_parser(["audio", "video"])
                .ignore_case(true)
                .default_value("audio"),
        )
        .arg(
            Arg::new("stages")
                .short('s')
                .long("stages")
                .value_name("COUNT")
                .help("Number of encoding stages sharing one arbiter.")
                .value_parser(value_parser!(usize))
                .default_value("2"),
        )
        .arg(
            Arg::new("frames")
                .short('f')
                .long("frames")
                .value_name("COUNT")
                .help("Number of input frames pushed into each stage.")
                .value_parser(value_parser!(u64))
                .default_value("100"),
        )
        .arg(
            Arg::new("depth")
                .short('d')
                .long("depth")
                .value_name("FRAMES")
                .help("Frames held while the engine opens before upstream blocks.")
                .value_parser(value_parser!(usize))
                .required(false),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON stage configuration.")
                .required(false),
        )
        .get_matches();

    let video = matches
        .get_one::<String>("kind")
        .is_some_and(|kind| kind.eq_ignore_ascii_case("video"));
    let stages = matches.get_one::<usize>("stages").copied().unwrap_or(1);
    let frames = matches.get_one::<u64>("frames").copied().unwrap_or(0);

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => EncodeConfig::from_json_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => EncodeConfig::default(),
    };
    if let Some(depth) = matches.get_one::<usize>("depth") {
        config.max_queue_depth = *depth;
    }
    config.validate()?;

    info!(
        "{} {}: {} {} stages, {} frames each",
        app_name(),
        version(),
        stages,
        if video { "video" } else { "audio" },
        frames
    );

    let arbiter = Arbiter::new();
    let mut coordinator = PipelineCoordinator::new();
    let mut feeders = Vec::with_capacity(stages);
    let mut drains = Vec::with_capacity(stages);
    let mut healths = Vec::with_capacity(stages);

    for index in 0..stages {
        let stage_config = EncodeConfig {
            name: format!("{}-{}", config.name, index),
            ..config.clone()
        };
        let engine = if video {
            PassthroughEngine::video()
        } else {
            PassthroughEngine::audio()
        };
        let stage = EncodeStage::new(engine, arbiter.clone(), stage_config, Probe::silent());
        let name = stage.name().to_string();
        healths.push((name.clone(), stage.health()));

        let mut runner = EncodeRunner::new(stage);
        let input = runner.input();
        let output = runner.take_output();
        coordinator.add_stage(Box::new(runner));

        feeders.push(tokio::spawn(feed(input, video, frames)));
        drains.push(tokio::spawn(drain(name, output)));
    }

    let failures = coordinator.run().await;

    for feeder in feeders {
        feeder.await??;
    }
    for drain in drains {
        let (name, frames, bytes) = drain.await?;
        info!("{}: {} encoded frames, {} bytes", name, frames, bytes);
    }
    for (name, health) in healths {
        info!("{}: {}", name, health.summary());
    }

    if failures > 0 {
        anyhow::bail!("{} stages failed", failures);
    }
    Ok(())
}

fn input_flow(video: bool) -> FlowDescriptor {
    if video {
        FlowDescriptor::picture(PictureFlow {
            pixel_format: PixelFormat::Yuv420p,
            width: WIDTH,
            height: HEIGHT,
            visible: None,
            fps: Some(Rational::new(FPS, 1)),
            sar: Some(Rational::new(1, 1)),
        })
    } else {
        FlowDescriptor::sound(SoundFlow {
            sample_format: SampleFormat::S16,
            channels: CHANNELS,
            rate: SAMPLE_RATE,
        })
    }
}

fn synthetic_picture(index: u64) -> Frame {
    let luma = (WIDTH * HEIGHT) as usize;
    Frame::picture(
        vec![
            Bytes::from(vec![(index % 256) as u8; luma]),
            Bytes::from(vec![128u8; luma / 4]),
            Bytes::from(vec![128u8; luma / 4]),
        ],
        WIDTH,
        HEIGHT,
        FrameClock::with_pts(index * CLOCK_FREQ / FPS),
    )
}

/// Push the flow definition and `frames` synthetic frames into a stage
async fn feed(input: mpsc::Sender<StageInput>, video: bool, frames: u64) -> Result<()> {
    let (message, reply) = StageInput::control(Control::SetInputFlow(input_flow(video)));
    input
        .send(message)
        .await
        .map_err(|_| anyhow!("Stage input closed"))?;
    reply.await??;

    let sample_size = SampleFormat::S16.bytes_per_sample() as u64 * CHANNELS as u64;
    let mut pts = 0;
    for index in 0..frames {
        let frame = if video {
            synthetic_picture(index)
        } else {
            let samples = CHUNK_SAMPLES[(index % CHUNK_SAMPLES.len() as u64) as usize];
            let frame = Frame::block(
                Bytes::from(vec![0u8; (samples * sample_size) as usize]),
                FrameClock::with_pts(pts),
            );
            pts += samples * CLOCK_FREQ / SAMPLE_RATE;
            frame
        };
        input
            .send(StageInput::Frame(frame))
            .await
            .map_err(|_| anyhow!("Stage input closed"))?;
    }
    Ok(())
}

/// Consume a stage output until the stage goes away
async fn drain(
    name: String,
    mut output: mpsc::UnboundedReceiver<OutputEvent>,
) -> (String, u64, usize) {
    let mut frames = 0;
    let mut bytes = 0;
    while let Some(event) = output.recv().await {
        match event {
            OutputEvent::FlowDef(flow) => debug!("{}: output flow {:?}", name, flow),
            OutputEvent::Frame(frame) => {
                frames += 1;
                bytes += frame.size();
            }
        }
    }
    (name, frames, bytes)
}
