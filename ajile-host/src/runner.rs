// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! The load-start-wait-stop flow every example program shares.
use std::time::Duration;

use log::{info, warn};

use crate::config::{CameraSettings, RunParameters};
use crate::device::{DeviceType, RunState};
use crate::driver::{ControllerDriver, HostSystem};
use crate::error::{NotFound, Result};
use crate::project::{Component, Image, Project, SequenceId};
use crate::timing::WaitTimeout;
use crate::wire::RetrieveFrom;

/// How long to wait for a component to settle after being told to stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for each captured image when reading them back.
const RETRIEVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Builds a project for a display-only example.
pub type PlainBuilder = fn(&RunParameters, &[Component]) -> Result<Project>;

/// Builds a project for an example with a camera.
pub type CameraBuilder = fn(&RunParameters, &CameraSettings, &[Component]) -> Result<Project>;

/// The shapes of example program.
#[derive(Clone, Copy)]
pub enum ProjectBuilder {
    /// Every sequence runs in turn on its own component.
    Plain(PlainBuilder),

    /// Like `Plain`, and the captured images are read back afterwards.
    Camera(CameraBuilder),

    /// The DMD sequence (`sequence_id`) waits for the camera sequence (`sequence_id + 1`) to
    /// trigger it. The captured images are read back afterwards.
    CameraDmd(CameraBuilder),
}

/// What an example run left behind.
#[derive(Clone, Debug, Default)]
pub struct RunReport {
    /// Each sequence that ran, with the component it ran on.
    pub sequences: Vec<(SequenceId, usize)>,

    /// Captured images in frame order. Empty for display-only examples.
    pub images: Vec<Image>,
}

fn camera_settings(params: &RunParameters, components: &[Component]) -> Result<CameraSettings> {
    let camera = components
        .iter()
        .find(|component| component.device_type().is_camera())
        .ok_or(NotFound::DeviceType(DeviceType::Cmv4000Mono))?;
    Ok(params.camera_settings(camera.rows()))
}

fn find_component(project: &Project, sequence: SequenceId) -> Result<usize> {
    let device_type = project
        .sequence(sequence)
        .ok_or(NotFound::Sequence(sequence))?
        .device_type();
    project
        .component_index_with_device_type(device_type)
        .ok_or_else(|| NotFound::DeviceType(device_type).into())
}

fn stop_and_wait(driver: &ControllerDriver, component: usize) -> Result<()> {
    driver.stop_sequence(component)?;
    driver.wait_for_state(component, RunState::Stopped, STOP_TIMEOUT)
}

/// Read back the capture of every frame of `sequence`.
fn read_back(driver: &ControllerDriver, project: &Project, sequence: SequenceId) -> Result<Vec<Image>> {
    let sequence = project.sequence(sequence).ok_or(NotFound::Sequence(sequence))?;
    let mut images = Vec::new();
    for frame in sequence.frames() {
        let image = driver.retrieve_image(RetrieveFrom::Image(frame.image_id()), RETRIEVE_TIMEOUT)?;
        if image.is_empty() {
            warn!("Timed out waiting for the capture of image {}", frame.image_id());
        } else {
            images.push(image);
        }
    }
    Ok(images)
}

/// Build a project for the connected controller, load it and run it.
///
/// Sequences that repeat forever run until `until_stopped` returns, which is given the driver
/// and the component to watch. Finite sequences are waited for.
pub fn run_example<F>(
    host: &HostSystem,
    builder: ProjectBuilder,
    params: &RunParameters,
    mut until_stopped: F,
) -> Result<RunReport>
where
    F: FnMut(&ControllerDriver, usize) -> Result<()>,
{
    let driver = host.driver();
    let mut components = host.components();
    params.apply_memory_budget(&mut components);
    let project = match builder {
        ProjectBuilder::Plain(build) => build(params, &components)?,
        ProjectBuilder::Camera(build) | ProjectBuilder::CameraDmd(build) => {
            let settings = camera_settings(params, &components)?;
            build(params, &settings, &components)?
        }
    };
    let sequence_id = SequenceId(params.sequence_id);
    let component = find_component(&project, sequence_id)?;
    let camera = match builder {
        ProjectBuilder::CameraDmd(_) => {
            let camera_sequence = SequenceId(params.sequence_id + 1);
            Some((camera_sequence, find_component(&project, camera_sequence)?))
        }
        _ => None,
    };

    stop_and_wait(&driver, component)?;
    if let Some((_, camera_component)) = camera {
        stop_and_wait(&driver, camera_component)?;
    }
    driver.load_project(&project)?;
    driver.wait_for_load_complete(WaitTimeout::Forever)?;

    let mut report = RunReport::default();
    match camera {
        None => {
            let sequences: Vec<SequenceId> = project.sequences().map(|s| s.id()).collect();
            for sequence in sequences {
                let component = project.bound_component(sequence)?;
                info!("Starting sequence {} on component {}", sequence, component);
                driver.start_sequence(sequence, component, 1)?;
                if params.repeat_count == 0 {
                    until_stopped(&driver, component)?;
                    driver.stop_sequence(component)?;
                }
                driver.wait_for_state(component, RunState::Stopped, WaitTimeout::Forever)?;
                report.sequences.push((sequence, component));
                if let ProjectBuilder::Camera(_) = builder {
                    report.images.extend(read_back(&driver, &project, sequence)?);
                }
            }
        }
        Some((camera_sequence, camera_component)) => {
            // The DMD goes first, it waits on the camera.
            driver.start_sequence(sequence_id, component, 1)?;
            driver.start_sequence(camera_sequence, camera_component, 1)?;
            if params.repeat_count == 0 {
                until_stopped(&driver, camera_component)?;
                info!("Stopping the camera, then the DMD");
                stop_and_wait(&driver, camera_component)?;
                driver.stop_sequence(component)?;
            }
            driver.wait_for_state(camera_component, RunState::Stopped, WaitTimeout::Forever)?;
            driver.wait_for_state(component, RunState::Stopped, WaitTimeout::Forever)?;
            report.sequences.push((sequence_id, component));
            report.sequences.push((camera_sequence, camera_component));
            report.images = read_back(&driver, &project, camera_sequence)?;
        }
    }
    Ok(report)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::driver::HostOptions;
    use crate::test::{dmd_project, MockTransport};
    use crate::timing::Ticks;
    use crate::transport::{ConnectionSettings, Transport};
    use crate::wire::{Opcode, Request};

    fn one_frame(params: &RunParameters, components: &[Component]) -> Result<Project> {
        let mut project = dmd_project(1, params.frame_time(Ticks::from_ms(1.0)));
        project.set_components(components.to_vec());
        Ok(project)
    }

    #[test]
    fn forever_sequence_runs_until_stopped() {
        let components = dmd_project(1, Ticks::from_ms(1.0)).components().to_vec();
        let mock = Arc::new(MockTransport::new(components));
        let host = HostSystem::with_transport(
            Arc::clone(&mock) as Arc<dyn Transport>,
            &ConnectionSettings::default(),
            HostOptions::default(),
        )
        .unwrap();
        let mut watched = Vec::new();
        let report = run_example(
            &host,
            ProjectBuilder::Plain(one_frame),
            &RunParameters::default(),
            |_, component| {
                watched.push(component);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(watched, [1]);
        assert_eq!(report.sequences, [(SequenceId(1), 1)]);
        assert!(report.images.is_empty());
        let opcodes: Vec<Opcode> = mock
            .requests()
            .iter()
            .map(Request::opcode)
            .filter(|opcode| {
                matches!(
                    opcode,
                    Opcode::StopSequence | Opcode::LoadCommit | Opcode::StartSequence
                )
            })
            .collect();
        assert_eq!(
            opcodes,
            [
                Opcode::StopSequence,
                Opcode::LoadCommit,
                Opcode::StartSequence,
                Opcode::StopSequence
            ]
        );
    }

    #[test]
    fn missing_sequence() {
        let components = dmd_project(1, Ticks::from_ms(1.0)).components().to_vec();
        let mock = Arc::new(MockTransport::new(components));
        let host = HostSystem::with_transport(
            mock,
            &ConnectionSettings::default(),
            HostOptions::default(),
        )
        .unwrap();
        let params = RunParameters {
            sequence_id: 4,
            ..RunParameters::default()
        };
        let result = run_example(&host, ProjectBuilder::Plain(one_frame), &params, |_, _| Ok(()));
        assert!(matches!(
            result,
            Err(crate::Error::NotFound(NotFound::Sequence(SequenceId(4))))
        ));
    }
}
