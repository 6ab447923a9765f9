//! Command line handling shared by the demos.
// Not every demo uses every helper.
#![allow(dead_code)]
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use log::info;

use ajile_host::{
    Component, ConnectionSettings, HostOptions, HostSystem, Image, Interface, RunParameters,
};
use ajile_sim::{Pacing, SimulatedDevice};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum InterfaceArg {
    Usb2,
    Usb3,
    Pcie,
    Gige,
}

impl From<InterfaceArg> for Interface {
    fn from(arg: InterfaceArg) -> Self {
        match arg {
            InterfaceArg::Usb2 => Interface::Usb2,
            InterfaceArg::Usb3 => Interface::Usb3,
            InterfaceArg::Pcie => Interface::Pcie,
            InterfaceArg::Gige => Interface::Gige,
        }
    }
}

#[derive(Args, Debug)]
pub struct ConnectionArgs {
    /// Controller address.
    #[arg(long, default_value_t = Ipv4Addr::new(192, 168, 200, 1))]
    pub ip: Ipv4Addr,

    #[arg(long, value_enum, default_value_t = InterfaceArg::Usb2)]
    pub interface: InterfaceArg,

    /// Which controller to use when several share an interface.
    #[arg(long, default_value_t = 0)]
    pub device_number: u32,

    /// A JSON file of run parameters. Missing fields keep their defaults.
    #[arg(long)]
    pub params: Option<PathBuf>,

    /// Drive a simulated controller instead of real hardware.
    #[arg(long)]
    pub simulate: bool,
}

/// A connected host, and the simulated device behind it if there is one.
pub struct Connection {
    pub host: HostSystem,
    // Dropped after the host so the host disconnects first.
    _device: Option<SimulatedDevice>,
}

impl ConnectionArgs {
    pub fn run_parameters(&self) -> Result<RunParameters> {
        match &self.params {
            Some(path) => {
                let json = fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                RunParameters::from_json(&json)
                    .with_context(|| format!("parsing {}", path.display()))
            }
            None => Ok(RunParameters::default()),
        }
    }

    /// Connect to the controller, or to a simulated one with `simulated` components.
    pub fn connect(&self, simulated: Vec<Component>) -> Result<Connection> {
        if self.simulate {
            info!("Starting a simulated controller");
            let device = SimulatedDevice::new(simulated, Pacing::RealTime { speedup: 1.0 })?;
            let host = device.connect(HostOptions::default())?;
            return Ok(Connection {
                host,
                _device: Some(device),
            });
        }
        let settings = ConnectionSettings {
            interface: self.interface.into(),
            ip: self.ip,
            device_number: self.device_number,
            ..ConnectionSettings::default()
        };
        let host = HostSystem::connect(&settings, HostOptions::default())
            .with_context(|| format!("connecting to {}", self.ip))?;
        Ok(Connection {
            host,
            _device: None,
        })
    }
}

/// The mean sample value of an image, across every channel.
pub fn mean_sample(image: &Image) -> f64 {
    let samples = image.width() as u64 * image.height() as u64 * image.channels() as u64;
    if samples == 0 {
        return 0.0;
    }
    let mut total = 0u64;
    for row in 0..image.height() {
        for column in 0..image.width() {
            for channel in 0..image.channels() {
                total += image.sample(row, column, channel) as u64;
            }
        }
    }
    total as f64 / samples as f64
}
