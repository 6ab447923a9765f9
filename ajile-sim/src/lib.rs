// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! A simulated Ajile controller for exercising [`ajile_host`] without hardware.
//!
//! [`SimulatedDevice`] runs the host crate's sequence engine behind the real wire protocol, so a
//! [`HostSystem`][ajile_host::HostSystem] connected to it goes through the same transport,
//! dispatch threads and queues it would with a controller on the other end of a cable.
//!
//! ```
//! use ajile_host::{Component, DeviceType, HostOptions};
//! use ajile_sim::{Pacing, SimulatedDevice};
//!
//! let device = SimulatedDevice::new(
//!     vec![
//!         Component::for_device(DeviceType::AjileController),
//!         Component::for_device(DeviceType::Dmd4500),
//!     ],
//!     Pacing::Free,
//! )?;
//! let host = device.connect(HostOptions::default())?;
//! assert_eq!(host.components().len(), 2);
//! # Ok::<(), ajile_host::Error>(())
//! ```
mod device;
mod pipe;

pub use device::{DisplayRecord, MissedTrigger, OutputPulse, Pacing, SimLink, SimulatedDevice};
pub use pipe::{pipe, PipeReader, PipeWriter};
