use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use log::info;

use ajile_host::timing::Ticks;
use ajile_host::{
    Component, DeviceType, Frame, Image, ImageId, Project, RunState, Sequence, SequenceId,
    SequenceItem, SequenceKind,
};

mod common;

/// Capture images from the camera and report on each as it arrives.
#[derive(Parser, Debug)]
struct Cli {
    #[command(flatten)]
    connection: common::ConnectionArgs,

    /// Number of images to acquire.
    #[arg(long, default_value_t = 100)]
    count: u32,
}

const DEFAULT_EXPOSURE: Ticks = Ticks(1_000_000);
const WAIT: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let params = cli.connection.run_parameters()?;
    let connection = cli.connection.connect(vec![
        Component::for_device(DeviceType::DmdCameraController),
        Component::for_device(DeviceType::Dmd4500),
        Component::for_device(DeviceType::Cmv4000Mono),
    ])?;
    let host = &connection.host;
    let driver = host.driver();

    let mut components = host.components();
    params.apply_memory_budget(&mut components);
    let camera = match components
        .iter()
        .position(|component| component.device_type().is_camera())
    {
        Some(camera) => camera,
        None => bail!("No camera is connected"),
    };
    let device_type = components[camera].device_type();
    let settings = params.camera_settings(components[camera].rows());

    let sequence = SequenceId(params.sequence_id);
    let mut project = Project::new("camera-acquire");
    project.set_components(components);
    project.add_sequence(Sequence::new(
        sequence,
        "acquire",
        device_type,
        SequenceKind::Preload,
        params.repeat_count,
    ));
    project.add_sequence_item(SequenceItem::new(sequence, 1))?;
    let mut image = Image::for_device(ImageId(1), device_type);
    image.set_height(settings.captured_rows());
    image.set_bit_depth(settings.bit_depth);
    project.add_image(image);
    let mut frame = Frame::new(sequence, ImageId(1), params.frame_time(DEFAULT_EXPOSURE));
    settings.apply(&mut frame);
    project.add_frame(frame)?;

    driver.stop_sequence(camera)?;
    driver.wait_for_state(camera, RunState::Stopped, WAIT)?;
    driver.load_project(&project)?;
    driver.wait_for_load_complete(WAIT)?;

    driver.acquire_images(cli.count, camera)?;
    driver.start_sequence(sequence, camera, 1)?;
    let mut first_timestamp = None;
    let mut last_timestamp = Ticks::ZERO;
    for _ in 0..cli.count {
        driver.wait_for_acquired_image(camera, WAIT)?;
        let acquired = match driver.pop_acquired_image(camera)? {
            Some(acquired) => acquired,
            None => continue,
        };
        first_timestamp.get_or_insert(acquired.timestamp);
        last_timestamp = acquired.timestamp;
        println!(
            "{:5} at {}: {}x{}, mean {:.1}",
            acquired.capture_number,
            acquired.timestamp,
            acquired.image.width(),
            acquired.image.height(),
            common::mean_sample(&acquired.image)
        );
    }
    driver.stop_sequence(camera)?;
    driver.wait_for_state(camera, RunState::Stopped, WAIT)?;

    if let Some(first) = first_timestamp {
        let elapsed = last_timestamp.saturating_sub(first).to_duration();
        if cli.count > 1 && !elapsed.is_zero() {
            info!(
                "{} frames in {:?}, {:.1} frames per second",
                cli.count,
                elapsed,
                (cli.count - 1) as f64 / elapsed.as_secs_f64()
            );
        }
    }
    Ok(())
}
