use shade_protocol::wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {addr} failed after {attempts} attempts: {last}")]
    Connect {
        addr: String,
        attempts: u32,
        last: String,
    },

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("peer closed the connection")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
