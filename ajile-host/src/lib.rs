// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! A pure-Rust host driver for Ajile DMD and camera controllers.
//!
//! A controller hosts a handful of components: itself, one or more digital micromirror devices
//! (DMDs) and optionally cameras. The host describes what every component should do in a
//! [`Project`], sends it to the controller, and then starts, steers and stops sequences on each
//! component while the controller reports progress and hands captured images back.
//!
//! # Quick Start
//! ```no_run
//! use ajile_host::{
//!     ConnectionSettings, DeviceType, Frame, HostOptions, HostSystem, Image, ImageId, Project,
//!     RunState, Sequence, SequenceId, SequenceItem, SequenceKind, Ticks, WaitTimeout,
//! };
//!
//! let host = HostSystem::connect(&ConnectionSettings::default(), HostOptions::default())?;
//! let mut project = Project::new("checkerboard");
//! // Start from the components the controller reported
//! project.set_components(host.components());
//! let sequence = SequenceId(1);
//! project.add_sequence(Sequence::new(sequence, "board", DeviceType::Dmd4500, SequenceKind::Preload, 0));
//! project.add_sequence_item(SequenceItem::new(sequence, 1))?;
//! let pixels: Vec<u8> = (0..1140 * 912).map(|i| if (i / 50) % 2 == 0 { 255 } else { 0 }).collect();
//! project.add_image(Image::from_row_major_8bit(ImageId(1), 1140, 912, &pixels, DeviceType::Dmd4500)?);
//! project.add_frame(Frame::new(sequence, ImageId(1), Ticks::from_ms(10.0)))?;
//!
//! let driver = host.driver();
//! driver.load_project(&project)?;
//! driver.wait_for_load_complete(WaitTimeout::Forever)?;
//! let dmd = project.bound_component(sequence)?;
//! driver.start_sequence(sequence, dmd, 1)?;
//! std::thread::sleep(std::time::Duration::from_secs(5));
//! driver.stop_sequence(dmd)?;
//! driver.wait_for_state(dmd, RunState::Stopped, WaitTimeout::Forever)?;
//! # Ok::<(), ajile_host::Error>(())
//! ```
//! This connects over the default interface (USB2, which presents itself as a network interface
//! at `192.168.200.1`), shows a single striped image on the DMD until stopped, and waits for the
//! DMD to finish the frame it was showing.
//!
//! # Sequences, Items and Frames
//! Each component runs one [`Sequence`] at a time. A sequence is a list of [sequence
//! items][SequenceItem], and an item is a list of [frames][Frame]. A frame is the smallest unit of
//! work: one image shown by a DMD, or one exposure taken by a camera. Items repeat their frames
//! `repeat_count` times (0 repeats until the host moves on with
//! [`ControllerDriver::next_sequence_item`]), and sequences repeat their items the same way.
//!
//! Preloaded sequences refer to images loaded with the project by [`ImageId`]. Streaming
//! sequences carry their images along with each item, pushed while the sequence runs with
//! [`ControllerDriver::add_streaming_sequence_item`].
//!
//! # Triggers
//! Components are tied together with [trigger rules][TriggerRule]: when any source event
//! happens (a frame starting or ending on another component, an external input pin), the
//! destination action fires (start a frame, start an item, pulse an output pin). A DMD that
//! waits for a camera's `FrameStarted` shows exactly one image per exposure, for example.
//!
//! # Time
//! Device time is counted in [`Ticks`] of a 100MHz clock. Waits on the host take a
//! [`WaitTimeout`], which converts from a [`Duration`][std::time::Duration] or from the
//! controller convention of a tick count where `-1` waits forever.

pub mod arena;
pub mod config;
pub mod device;
pub mod driver;
pub mod engine;
pub mod error;
pub mod patterns;
pub mod project;
pub mod runner;
#[cfg(test)]
mod test;
pub mod timing;
pub mod transport;
mod util;
pub mod wire;

pub use config::{CameraSettings, RunParameters};
pub use device::{DeviceType, FramePosition, RunState, SequenceStatusValues, StatusCode};
pub use driver::{ControllerDriver, HostOptions, HostSystem};
pub use error::{Error, NotFound, ProjectError, Result, TransportError};
pub use project::*;
pub use runner::{run_example, ProjectBuilder, RunReport};
pub use timing::{Ticks, WaitTimeout};
pub use transport::{ConnectionSettings, Interface, Transport};
pub use wire::{AcquiredImage, RetrieveFrom};
