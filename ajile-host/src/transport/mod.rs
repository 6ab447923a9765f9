// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! The link between the host and a controller.
//!
//! Every interface (USB2, USB3, PCIe and GigE) carries the same framed protocol, so the
//! [`Transport`] contract is small: synchronous request/response exchanges, plus per-component
//! streams of status messages and captured images. [`StreamTransport`] implements it over any
//! byte stream a [`Link`] can open.
mod stream;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::Receiver;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::arena::ImageArena;
use crate::error::TransportError;
use crate::wire::{AcquiredImage, Opcode, StatusMessage};

pub use stream::{DeviceNodeLink, Link, StreamTransport, TcpLink};

/// The physical interface a controller is attached by.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Interface {
    Usb2,
    Usb3,
    Pcie,
    Gige,
}

impl Default for Interface {
    fn default() -> Self {
        Interface::Usb2
    }
}

/// Where to find a controller.
///
/// The network settings are used by GigE (and USB2, which presents itself as a network
/// interface), the device number by USB3 and PCIe.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub interface: Interface,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub port: u16,
    pub device_number: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            interface: Interface::default(),
            ip: Ipv4Addr::new(192, 168, 200, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::UNSPECIFIED,
            port: 5005,
            device_number: 0,
        }
    }
}

/// How hard to try when connecting or a repeatable request fails in a way that might succeed
/// later.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Run `operation` until it succeeds, fails for good, or runs out of attempts. The delay
    /// between attempts doubles each time, up to `max_delay`.
    pub fn run<T, F>(&self, what: &str, mut operation: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Result<T, TransportError>,
    {
        let mut delay = self.initial_delay;
        let mut attempt = 1;
        loop {
            match operation() {
                Err(err) if err.is_retryable() && attempt < self.attempts => {
                    warn!(
                        "{} failed ({}), retrying in {:?} (attempt {} of {})",
                        what, err, delay, attempt, self.attempts
                    );
                    thread::sleep(delay);
                    delay = (delay * 2).min(self.max_delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// The operations every interface back-end provides.
///
/// Implementations serialize concurrent requests. Status messages and images for components
/// nobody has subscribed to yet are kept until someone does, and never dropped.
pub trait Transport: Send + Sync {
    /// Open the connection.
    fn start(&self, settings: &ConnectionSettings) -> Result<(), TransportError>;

    /// Send one request and wait for its response payload.
    fn request(&self, opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Every status message `component` sends, in order. The stream ends when the connection
    /// closes.
    fn subscribe_status(&self, component: usize) -> Receiver<StatusMessage>;

    /// Every image camera `component` sends, with pixels copied into `arena`.
    fn subscribe_images(&self, component: usize, arena: Arc<ImageArena>)
        -> Receiver<AcquiredImage>;

    /// Close the connection and release the interface. Safe to call more than once.
    fn stop(&self);
}

/// The device node USB3 and PCIe controllers show up as.
fn device_node(interface: Interface, device_number: u32) -> String {
    let kind = match interface {
        Interface::Pcie => "pcie",
        _ => "usb3",
    };
    format!("/dev/ajile-{}{}", kind, device_number)
}

/// Create an (unstarted) transport for the interface `settings` names.
pub fn open(settings: &ConnectionSettings, response_timeout: Duration) -> Arc<dyn Transport> {
    match settings.interface {
        Interface::Usb2 | Interface::Gige => {
            Arc::new(StreamTransport::new(TcpLink::default(), response_timeout))
        }
        Interface::Usb3 | Interface::Pcie => Arc::new(StreamTransport::new(
            DeviceNodeLink::new(device_node(settings.interface, settings.device_number)),
            response_timeout,
        )),
    }
}
