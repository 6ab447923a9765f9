use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::Parser;
use log::{info, warn};

use ajile_host::patterns::{checkerboards, sinusoids, Pattern};
use ajile_host::timing::Ticks;
use ajile_host::{
    Component, DeviceType, Frame, Image, ImageId, Project, RunState, Sequence, SequenceId,
    SequenceItem, SequenceKind, StatusCode,
};

mod common;

/// Stream patterns to the DMD faster than they could be preloaded.
#[derive(Parser, Debug)]
struct Cli {
    #[command(flatten)]
    connection: common::ConnectionArgs,

    /// How long to stream for, in seconds.
    #[arg(long, default_value_t = 10.0)]
    seconds: f64,

    /// Frames in each streamed item.
    #[arg(long, default_value_t = 64)]
    frames_per_item: usize,

    /// Report every this many frames.
    #[arg(long, default_value_t = 1000)]
    stride: u32,
}

const WAIT: Duration = Duration::from_secs(5);

fn patterns(width: u32, height: u32) -> Vec<Pattern> {
    let mut patterns: Vec<Pattern> = checkerboards(width, height, 50, 100).into();
    patterns.extend(sinusoids(width, height, 3, 64.0));
    patterns
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let params = cli.connection.run_parameters()?;
    let connection = cli.connection.connect(vec![
        Component::for_device(DeviceType::AjileController),
        Component::for_device(DeviceType::Dmd4500),
    ])?;
    let host = &connection.host;
    let driver = host.driver();

    let mut components = host.components();
    let dmd = match components
        .iter()
        .position(|component| component.device_type().is_dmd())
    {
        Some(dmd) => dmd,
        None => bail!("No DMD is connected"),
    };
    let original = components[dmd].clone();
    params.apply_memory_budget(&mut components);
    let device_type = original.device_type();

    let frame_time = params.frame_time(Ticks::from_sec(1.0 / 6600.0));
    let sequence = SequenceId(params.sequence_id);
    let images = patterns(original.columns(), original.rows())
        .iter()
        .map(|pattern| {
            Image::from_row_major_8bit(
                ImageId::NONE,
                pattern.width,
                pattern.height,
                &pattern.pixels,
                device_type,
            )
        })
        .collect::<ajile_host::Result<Vec<Image>>>()?;
    let mut item = SequenceItem::new(sequence, 1);
    for image in images.iter().cycle().take(cli.frames_per_item.max(1)) {
        item.add_frame(Frame::streaming(sequence, image.clone(), frame_time));
    }

    let mut project = Project::new("dmd-streaming");
    project.set_components(components);
    project.add_sequence(
        Sequence::new(sequence, "stream", device_type, SequenceKind::Stream, 0)
            .with_initial_state(RunState::Paused),
    );
    driver.stop_sequence(dmd)?;
    driver.wait_for_state(dmd, RunState::Stopped, WAIT)?;
    driver.load_project(&project)?;
    driver.wait_for_load_complete(WAIT)?;

    info!(
        "Streaming {}-frame items at {} per frame for {}s",
        cli.frames_per_item, frame_time, cli.seconds
    );
    driver.start_sequence(sequence, dmd, cli.stride.max(1))?;
    let deadline = Instant::now() + Duration::from_secs_f64(cli.seconds.max(0.0));
    let mut items = 0u64;
    while Instant::now() < deadline {
        // Blocks while the device's streaming memory is full.
        driver.add_streaming_sequence_item(&item, dmd)?;
        items += 1;
        while let Some(status) = driver.next_sequence_status(dmd)? {
            match status.code {
                StatusCode::FrameStarted => println!(
                    "{:8} frames at {}",
                    status.frame_count, status.timestamp
                ),
                StatusCode::Underrun => warn!("The DMD ran out of frames"),
                StatusCode::Backpressure => (),
            }
        }
    }
    driver.stop_sequence(dmd)?;
    driver.wait_for_state(dmd, RunState::Stopped, WAIT)?;
    info!("Streamed {} items", items);

    if params.image_memory_budget.is_some() {
        info!("Restoring the DMD's image memory");
        driver.load_component(&original, dmd)?;
    }
    Ok(())
}
