use crate::tcp::Dual;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Tun error: {0}")]
    TunError(#[from] tidy_tuntap::error::Error),

    #[error("Port: {0} has been unexpectedly closed")]
    PortClosed(u16),

    #[error("Port: {0} already in use")]
    PortInUse(u16),

    #[error("Stream for {0:?} has been closed")]
    StreamClosed(Dual),

    #[error("connection to {0:?} was refused or reset before it was established")]
    ConnectionRefused(Dual),
}
