// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use super::{ConnectionSettings, RetryPolicy, Transport};
use crate::arena::ImageArena;
use crate::error::TransportError;
use crate::wire::{self, AcquiredImage, Opcode, StatusMessage};

/// Large enough for a few full-size DMD images.
const READ_BUFFER_SIZE: usize = 1 << 20;

/// A way of opening a duplex byte stream to a controller.
pub trait Link: Send + Sync + 'static {
    type Reader: Read + Send + 'static;
    type Writer: Write + Send + 'static;

    fn open(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<(Self::Reader, Self::Writer), TransportError>;

    /// Make any read blocked on the other half of `writer`'s connection return.
    fn close(&self, writer: &mut Self::Writer);
}

/// USB2 and GigE controllers, both of which are reached over TCP.
#[derive(Clone, Debug)]
pub struct TcpLink {
    connect_timeout: Duration,
}

impl TcpLink {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpLink {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl Link for TcpLink {
    type Reader = BufReader<TcpStream>;
    type Writer = BufWriter<TcpStream>;

    fn open(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<(Self::Reader, Self::Writer), TransportError> {
        let address = SocketAddr::from((settings.ip, settings.port));
        let stream = TcpStream::connect_timeout(&address, self.connect_timeout)?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        Ok((
            BufReader::with_capacity(READ_BUFFER_SIZE, reader),
            BufWriter::new(stream),
        ))
    }

    fn close(&self, writer: &mut Self::Writer) {
        if let Err(err) = writer.get_ref().shutdown(Shutdown::Both) {
            debug!("Socket shutdown failed: {}", err);
        }
    }
}

/// USB3 and PCIe controllers, which the kernel driver exposes as a character device.
#[derive(Clone, Debug)]
pub struct DeviceNodeLink {
    path: PathBuf,
}

impl DeviceNodeLink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl Link for DeviceNodeLink {
    type Reader = BufReader<std::fs::File>;
    type Writer = BufWriter<std::fs::File>;

    fn open(
        &self,
        _settings: &ConnectionSettings,
    ) -> Result<(Self::Reader, Self::Writer), TransportError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => {
                    TransportError::DeviceNotFound(self.path.display().to_string())
                }
                _ => err.into(),
            })?;
        let reader = file.try_clone()?;
        Ok((
            BufReader::with_capacity(READ_BUFFER_SIZE, reader),
            BufWriter::new(file),
        ))
    }

    // The kernel driver ends pending reads once the last handle is closed.
    fn close(&self, _writer: &mut Self::Writer) {}
}

/// Where unsolicited frames go.
#[derive(Default)]
struct Routes {
    status: HashMap<usize, Sender<StatusMessage>>,
    images: HashMap<usize, (Sender<AcquiredImage>, Arc<ImageArena>)>,
    early_status: HashMap<usize, Vec<StatusMessage>>,
    early_images: HashMap<usize, Vec<Vec<u8>>>,
    closed: bool,
}

impl Routes {
    fn route_status(&mut self, message: StatusMessage) {
        let component = message.component;
        match self.status.get(&component) {
            Some(sender) => {
                if sender.send(message).is_err() {
                    debug!("Nobody is listening to component {} status", component);
                    self.status.remove(&component);
                }
            }
            None => self.early_status.entry(component).or_default().push(message),
        }
    }

    fn route_image(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let component = AcquiredImage::peek_component(payload)?;
        match self.images.get(&component) {
            Some((sender, arena)) => {
                let image = AcquiredImage::decode(payload, Some(arena))?;
                if sender.send(image).is_err() {
                    debug!("Nobody is listening to component {} images", component);
                    self.images.remove(&component);
                }
            }
            None => self
                .early_images
                .entry(component)
                .or_default()
                .push(payload.to_vec()),
        }
        Ok(())
    }

    /// Drop every subscription, ending the subscribers' streams.
    fn close(&mut self) {
        self.closed = true;
        self.status.clear();
        self.images.clear();
        self.early_status.clear();
        self.early_images.clear();
    }
}

struct Connection<W> {
    writer: W,
    responses: Receiver<Vec<u8>>,

    /// Responses still owed to requests that timed out.
    stale: usize,
    reader: JoinHandle<()>,
}

/// A [`Transport`] over a framed byte stream.
///
/// A reader thread demultiplexes incoming frames: responses go back to the (single) waiting
/// request, status messages and images go to the component's subscriber.
pub struct StreamTransport<L: Link> {
    link: L,
    response_timeout: Duration,
    retry: RetryPolicy,
    connection: Mutex<Option<Connection<L::Writer>>>,
    routes: Arc<Mutex<Routes>>,
}

impl<L: Link> StreamTransport<L> {
    pub fn new(link: L, response_timeout: Duration) -> Self {
        Self {
            link,
            response_timeout,
            retry: RetryPolicy::default(),
            connection: Mutex::new(None),
            routes: Arc::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn link(&self) -> &L {
        &self.link
    }
}

impl<L: Link> Transport for StreamTransport<L> {
    fn start(&self, settings: &ConnectionSettings) -> Result<(), TransportError> {
        let mut connection = self.connection.lock();
        if connection.is_some() {
            debug!("Transport already started");
            return Ok(());
        }
        let (reader, writer) = self.retry.run("Connecting", || self.link.open(settings))?;
        let (responses_tx, responses) = channel::unbounded();
        self.routes.lock().closed = false;
        let routes = Arc::clone(&self.routes);
        let reader = thread::Builder::new()
            .name("ajile-reader".to_string())
            .spawn(move || read_frames(reader, responses_tx, routes))?;
        info!("Connected over {:?}", settings.interface);
        *connection = Some(Connection {
            writer,
            responses,
            stale: 0,
            reader,
        });
        Ok(())
    }

    fn request(&self, opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.connection.lock();
        let connection = guard.as_mut().ok_or(TransportError::Closed)?;
        wire::write_frame(&mut connection.writer, opcode, payload)?;
        let deadline = Instant::now() + self.response_timeout;
        loop {
            match connection.responses.recv_deadline(deadline) {
                Ok(_) if connection.stale > 0 => connection.stale -= 1,
                Ok(response) => return Ok(response),
                Err(RecvTimeoutError::Timeout) => {
                    warn!("No response to {:?} within {:?}", opcode, self.response_timeout);
                    connection.stale += 1;
                    return Err(TransportError::ResponseTimeout(opcode));
                }
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Closed),
            }
        }
    }

    fn subscribe_status(&self, component: usize) -> Receiver<StatusMessage> {
        let (sender, receiver) = channel::unbounded();
        let mut routes = self.routes.lock();
        for message in routes.early_status.remove(&component).unwrap_or_default() {
            // The receiver is still in hand, so this cannot fail.
            let _ = sender.send(message);
        }
        if !routes.closed {
            routes.status.insert(component, sender);
        }
        receiver
    }

    fn subscribe_images(
        &self,
        component: usize,
        arena: Arc<ImageArena>,
    ) -> Receiver<AcquiredImage> {
        let (sender, receiver) = channel::unbounded();
        let mut routes = self.routes.lock();
        for payload in routes.early_images.remove(&component).unwrap_or_default() {
            match AcquiredImage::decode(&payload, Some(&arena)) {
                Ok(image) => {
                    let _ = sender.send(image);
                }
                Err(err) => error!(
                    "Dropping undecodable image from component {}: {}",
                    component, err
                ),
            }
        }
        if !routes.closed {
            routes.images.insert(component, (sender, arena));
        }
        receiver
    }

    fn stop(&self) {
        let connection = self.connection.lock().take();
        if let Some(mut connection) = connection {
            self.link.close(&mut connection.writer);
            drop(connection.writer);
            if connection.reader.join().is_err() {
                error!("The transport reader thread panicked");
            }
            info!("Disconnected");
        }
        self.routes.lock().close();
    }
}

impl<L: Link> Drop for StreamTransport<L> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_frames<R: Read>(mut reader: R, responses: Sender<Vec<u8>>, routes: Arc<Mutex<Routes>>) {
    let mut payload = Vec::new();
    loop {
        match wire::read_frame(&mut reader, &mut payload) {
            Ok(Opcode::Response) => {
                if responses.send(payload.clone()).is_err() {
                    break;
                }
            }
            Ok(Opcode::Status) => match StatusMessage::decode(&payload) {
                Ok(message) => routes.lock().route_status(message),
                // The gap in sequence numbers is reported by whoever reads the stream.
                Err(err) => error!("Dropping undecodable status message: {}", err),
            },
            Ok(Opcode::AcquiredImage) => {
                if let Err(err) = routes.lock().route_image(&payload) {
                    error!("Dropping undecodable image: {}", err);
                }
            }
            Ok(opcode) => warn!("Ignoring unexpected {:?} frame from the device", opcode),
            Err(TransportError::Closed) => {
                debug!("The device closed the connection");
                break;
            }
            Err(err) => {
                error!("Reading from the device failed: {}", err);
                break;
            }
        }
    }
    routes.lock().close();
}
