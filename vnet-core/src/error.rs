//! Socket error codes surfaced by the virtual network.

/// Error code of a failed socket operation.
///
/// Synchronous misuse is returned by the failing call and also recorded on
/// the socket. Asynchronous outcomes such as a refused connection only reach
/// the caller through the closed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum SocketError {
    /// Another socket already owns the requested address
    #[error("address already in use")]
    AddressInUse,

    /// The socket already has a local address
    #[error("socket is already bound")]
    AlreadyBound,

    /// Operation not valid in the socket's current state
    #[error("invalid socket state for this operation")]
    InvalidState,

    /// Address families of the two endpoints cannot interact
    #[error("host unreachable: incompatible address families")]
    HostUnreachable,

    /// No listener accepted the connection
    #[error("connection refused")]
    ConnectionRefused,

    /// Socket is already connected
    #[error("socket is already connected")]
    AlreadyConnected,

    /// A connection attempt is already in progress
    #[error("connection already in progress")]
    ConnectInProgress,

    /// Operation requires a connected socket
    #[error("socket is not connected")]
    NotConnected,

    /// Nothing to read, or no buffer space to write
    #[error("operation would block")]
    WouldBlock,

    /// Request exceeds the largest single operation the network accepts
    #[error("frame too large")]
    FrameTooLarge,

    /// Every port of the ephemeral range is bound
    #[error("ephemeral port range exhausted")]
    EphemeralPortsExhausted,
}

impl SocketError {
    /// True for errors that only mean "try again later".
    pub fn is_transient(&self) -> bool {
        matches!(self, SocketError::WouldBlock)
    }
}
