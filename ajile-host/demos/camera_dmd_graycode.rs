use std::fs;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use ajile_host::patterns::gray_codes;
use ajile_host::timing::{camera_exposure_budget, Ticks};
use ajile_host::{
    run_example, CameraSettings, Component, ControllerDriver, DeviceType, Error, Frame, Image,
    ImageId, NotFound, Project, ProjectBuilder, RunParameters, Sequence, SequenceId, SequenceItem,
    SequenceKind, TriggerAction, TriggerEvent, TriggerRule,
};

mod common;

/// Project Gray code patterns, capturing each one with the camera.
#[derive(Parser, Debug)]
struct Cli {
    #[command(flatten)]
    connection: common::ConnectionArgs,

    /// How long to run a sequence that repeats forever, in seconds.
    #[arg(long, default_value_t = 5)]
    seconds: u64,

    /// Write each captured image here as raw pixels.
    #[arg(long)]
    output: Option<PathBuf>,
}

/// Camera images are numbered after the patterns.
const CAMERA_IMAGE_BASE: u16 = 1000;

fn build(
    params: &RunParameters,
    settings: &CameraSettings,
    components: &[Component],
) -> ajile_host::Result<Project> {
    let dmd_sequence = SequenceId(params.sequence_id);
    let camera_sequence = SequenceId(params.sequence_id + 1);
    let mut project = Project::new("camera-dmd-graycode");
    project.set_components(components.to_vec());
    let (dmd, dmd_type) = components
        .iter()
        .enumerate()
        .find(|(_, component)| component.device_type().is_dmd())
        .map(|(index, component)| (index, component.device_type()))
        .ok_or(NotFound::DeviceType(DeviceType::Dmd4500))?;
    let (camera, camera_type) = components
        .iter()
        .enumerate()
        .find(|(_, component)| component.device_type().is_camera())
        .map(|(index, component)| (index, component.device_type()))
        .ok_or(NotFound::DeviceType(DeviceType::Cmv4000Mono))?;
    let geometry = components[dmd]
        .geometry()
        .ok_or(Error::InvalidArgument("the DMD has no geometry"))?;

    // The camera sets the pace; each exposure has to fit inside one pattern.
    let period = params.frame_time(Ticks::from_ms(10.0));
    let exposure = camera_exposure_budget(period);
    let dmd_frame_time = exposure.max(dmd_type.min_frame_time());

    project.add_sequence(Sequence::new(
        dmd_sequence,
        "gray codes",
        dmd_type,
        SequenceKind::Preload,
        params.repeat_count,
    ));
    project.add_sequence(Sequence::new(
        camera_sequence,
        "captures",
        camera_type,
        SequenceKind::Preload,
        params.repeat_count,
    ));
    project.add_sequence_item(SequenceItem::new(dmd_sequence, 1))?;
    project.add_sequence_item(SequenceItem::new(camera_sequence, 1))?;
    for (index, pattern) in gray_codes(geometry.columns, geometry.rows).iter().enumerate() {
        let pattern_id = ImageId(index as u16 + 1);
        project.add_image(Image::from_row_major_8bit(
            pattern_id,
            pattern.width,
            pattern.height,
            &pattern.pixels,
            dmd_type,
        )?);
        project.add_frame(Frame::new(dmd_sequence, pattern_id, dmd_frame_time))?;

        let capture_id = ImageId(CAMERA_IMAGE_BASE + index as u16);
        let mut capture = Image::for_device(capture_id, camera_type);
        capture.set_height(settings.captured_rows());
        capture.set_bit_depth(settings.bit_depth);
        project.add_image(capture);
        let mut frame = Frame::new(camera_sequence, capture_id, exposure);
        settings.apply(&mut frame);
        project.add_frame(frame)?;
    }
    project.add_trigger_rule(
        TriggerRule::new(dmd, TriggerAction::StartFrame)
            .with_source(camera, TriggerEvent::FrameStarted),
    );
    Ok(project)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let params = cli.connection.run_parameters()?;
    let connection = cli.connection.connect(vec![
        Component::for_device(DeviceType::DmdCameraController),
        Component::for_device(DeviceType::Dmd4500),
        Component::for_device(DeviceType::Cmv4000Mono),
    ])?;
    let seconds = cli.seconds;
    let report = run_example(
        &connection.host,
        ProjectBuilder::CameraDmd(build),
        &params,
        |_: &ControllerDriver, _| {
            info!("Running for {}s", seconds);
            sleep(Duration::from_secs(seconds));
            Ok(())
        },
    )?;

    for (index, image) in report.images.iter().enumerate() {
        println!(
            "Pattern {:2}: {}x{}, mean {:.1}",
            index,
            image.width(),
            image.height(),
            common::mean_sample(image)
        );
    }
    if let Some(output) = &cli.output {
        fs::create_dir_all(output).with_context(|| format!("creating {}", output.display()))?;
        for (index, image) in report.images.iter().enumerate() {
            let path = output.join(format!("capture-{:02}.raw", index));
            fs::write(&path, image.pixels())
                .with_context(|| format!("writing {}", path.display()))?;
        }
        info!("Wrote {} captures to {}", report.images.len(), output.display());
    }
    Ok(())
}
