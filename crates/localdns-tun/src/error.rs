use std::io;

use thiserror::Error;

use crate::flow::FlowKey;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Reading or writing the tunnel descriptor failed; the relay stops.
    #[error("tunnel I/O error: {0}")]
    TunnelIo(#[source] io::Error),
    /// A real socket failed; only the affected flow is torn down.
    #[error("relay socket error on {flow}: {source}")]
    RelaySocket {
        flow: FlowKey,
        #[source]
        source: io::Error,
    },
    #[error("{0} worker panicked")]
    WorkerPanicked(&'static str),
}

impl RelayError {
    pub fn socket(flow: FlowKey, source: io::Error) -> Self {
        RelayError::RelaySocket { flow, source }
    }
}
