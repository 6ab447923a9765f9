// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! A one-way in-memory byte stream.
use std::io::{self, Read, Write};

use crossbeam::channel::{self, Receiver, Sender};

/// Create a connected writer and reader. Dropping (or closing) the writer gives the reader an
/// end of file once everything written has been read.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (sender, receiver) = channel::unbounded();
    (
        PipeWriter {
            sender: Some(sender),
        },
        PipeReader {
            receiver,
            chunk: Vec::new(),
            offset: 0,
        },
    )
}

#[derive(Debug)]
pub struct PipeWriter {
    sender: Option<Sender<Vec<u8>>>,
}

impl PipeWriter {
    /// End the stream without dropping the writer.
    pub fn close(&mut self) {
        self.sender = None;
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        sender
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct PipeReader {
    receiver: Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    offset: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.offset == self.chunk.len() {
            match self.receiver.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.offset = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let available = &self.chunk[self.offset..];
        let count = available.len().min(buf.len());
        buf[..count].copy_from_slice(&available[..count]);
        self.offset += count;
        Ok(count)
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    #[test]
    fn bytes_arrive_in_order() {
        let (mut writer, mut reader) = pipe();
        let handle = thread::spawn(move || {
            writer.write_all(b"hello ").unwrap();
            writer.write_all(b"world").unwrap();
        });
        let mut received = String::new();
        reader.read_to_string(&mut received).unwrap();
        handle.join().unwrap();
        assert_eq!(received, "hello world");
    }

    #[test]
    fn closed_writer_is_eof_and_broken() {
        let (mut writer, mut reader) = pipe();
        writer.write_all(&[1, 2, 3]).unwrap();
        writer.close();
        assert_eq!(
            writer.write(&[4]).unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
        let mut small = [0u8; 2];
        assert_eq!(reader.read(&mut small).unwrap(), 2);
        assert_eq!(reader.read(&mut small).unwrap(), 1);
        assert_eq!(reader.read(&mut small).unwrap(), 0);
    }
}
