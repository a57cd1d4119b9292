use std::sync::{Arc, Condvar, Mutex};

use crate::{Error, Manager};

use super::stream::TcpStream;

/// A bound port, waiting for connections to reach ESTABLISHED.
#[derive(Debug)]
pub struct TcpListener {
    pub(crate) port: u16,
    pub(crate) manager: Arc<Mutex<Manager>>,
    pub(crate) cvar: Arc<Condvar>,
}

impl TcpListener {
    /// Block until a connection on this port completes its handshake,
    /// then hand back a stream over it.
    pub fn accept(&self) -> Result<TcpStream, Error> {
        let mut manager = self.manager.lock().unwrap();

        manager = self
            .cvar
            .wait_while(manager, |manager| {
                manager
                    .established
                    .get(&self.port)
                    .map(|entry| entry.queue.is_empty())
                    .unwrap_or(true)
            })
            .unwrap();

        let quad = manager
            .established
            .get_mut(&self.port)
            .and_then(|entry| entry.queue.pop_front())
            .ok_or(Error::PortClosed(self.port))?;

        let entry = manager
            .connections
            .get(&quad)
            .ok_or(Error::StreamClosed(quad.dst))?;

        Ok(TcpStream {
            manager: self.manager.clone(),
            quad,
            rvar: entry.rvar.clone(),
            wvar: entry.wvar.clone(),
            svar: entry.svar.clone(),
            closed: false,
        })
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let mut manager = self.manager.lock().unwrap();
        manager.bounded.remove(&self.port);
        manager.established.remove(&self.port);
    }
}
