use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

use crate::{Error, Manager};

use super::Quad;

/// An established connection's application-facing handle. Reads drain
/// the receiver's [`crate::byte_stream::ByteStream`]; writes feed the
/// sender's; both block on condvars the event loop notifies after every
/// segment it processes or tick it runs.
#[derive(Debug)]
pub struct TcpStream {
    pub(crate) manager: Arc<Mutex<Manager>>,
    pub(crate) quad: Quad,
    pub(crate) rvar: Arc<Condvar>,
    pub(crate) wvar: Arc<Condvar>,
    pub(crate) svar: Arc<Condvar>,
    pub(crate) closed: bool,
}

impl TcpStream {
    /// Queue a FIN once pending writes drain and block until the
    /// connection has fully torn down (or been reset).
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut manager = self.manager.lock().unwrap();
        if let Some(entry) = manager.connections.get_mut(&self.quad) {
            entry.conn.shutdown_write();
        }

        manager = self
            .svar
            .wait_while(manager, |manager| manager.connections.contains_key(&self.quad))
            .unwrap();
        drop(manager);
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut manager = self.manager.lock().unwrap();

        manager = self
            .rvar
            .wait_while(manager, |manager| {
                manager
                    .connections
                    .get(&self.quad)
                    .map(|entry| {
                        entry.conn.active()
                            && entry.conn.outbound_stream().size() == 0
                            && !entry.conn.outbound_stream().eof()
                    })
                    .unwrap_or(false)
            })
            .unwrap();

        let entry = manager
            .connections
            .get_mut(&self.quad)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, Error::StreamClosed(self.quad.dst)))?;

        if !entry.conn.active() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection has been reset",
            ));
        }
        if entry.conn.outbound_stream().error() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "stream overread"));
        }

        let n = buf.len().min(entry.conn.outbound_stream().size());
        let data = entry.conn.outbound_stream_mut().read(n);
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "write half of the stream is closed",
            ));
        }

        let mut manager = self.manager.lock().unwrap();

        manager = self
            .wvar
            .wait_while(manager, |manager| {
                manager
                    .connections
                    .get(&self.quad)
                    .map(|entry| entry.conn.active() && entry.conn.inbound_stream().remaining_capacity() == 0)
                    .unwrap_or(false)
            })
            .unwrap();

        let entry = manager
            .connections
            .get_mut(&self.quad)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, Error::StreamClosed(self.quad.dst)))?;

        if !entry.conn.active() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection has been reset",
            ));
        }

        Ok(entry.conn.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut manager = self.manager.lock().unwrap();

        manager = self
            .wvar
            .wait_while(manager, |manager| {
                manager
                    .connections
                    .get(&self.quad)
                    .map(|entry| {
                        entry.conn.active()
                            && (entry.conn.bytes_in_flight() > 0 || entry.conn.inbound_stream().size() > 0)
                    })
                    .unwrap_or(false)
            })
            .unwrap();
        drop(manager);
        Ok(())
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        self.close();
    }
}
