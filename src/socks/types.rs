//! SOCKS5 type definitions

use super::consts::*;
use crate::error::Socks5Error;
use std::fmt;

/// SOCKS5 command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCommand {
    /// TCP CONNECT - establish a TCP connection to target
    Connect,
    /// TCP BIND - wait for incoming connection (not supported)
    Bind,
    /// UDP ASSOCIATE - establish UDP relay
    UdpAssociate,
}

impl SocksCommand {
    /// Parse a command byte into SocksCommand
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            SOCKS5_CMD_TCP_CONNECT => Some(SocksCommand::Connect),
            SOCKS5_CMD_TCP_BIND => Some(SocksCommand::Bind),
            SOCKS5_CMD_UDP_ASSOCIATE => Some(SocksCommand::UdpAssociate),
            _ => None,
        }
    }

    /// Convert SocksCommand to byte
    pub fn to_byte(self) -> u8 {
        match self {
            SocksCommand::Connect => SOCKS5_CMD_TCP_CONNECT,
            SocksCommand::Bind => SOCKS5_CMD_TCP_BIND,
            SocksCommand::UdpAssociate => SOCKS5_CMD_UDP_ASSOCIATE,
        }
    }
}

impl fmt::Display for SocksCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksCommand::Connect => write!(f, "CONNECT"),
            SocksCommand::Bind => write!(f, "BIND"),
            SocksCommand::UdpAssociate => write!(f, "UDP ASSOCIATE"),
        }
    }
}

/// Authentication method types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication required
    None,
    /// Username/password authentication
    Password,
}

impl AuthMethod {
    /// Convert to SOCKS5 method byte
    pub fn to_byte(self) -> u8 {
        match self {
            AuthMethod::None => SOCKS5_AUTH_METHOD_NONE,
            AuthMethod::Password => SOCKS5_AUTH_METHOD_PASSWORD,
        }
    }
}

/// Progress of one SOCKS5 connection
///
/// ```text
/// Init -> MethodNegotiated -> [Authenticating] -> CommandReceived
///      -> {Connecting -> Relaying | UdpAssociated} -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5State {
    /// Waiting for the method list
    Init,
    /// Method chosen and replied
    MethodNegotiated,
    /// Username/password sub-negotiation running
    Authenticating,
    /// Request read
    CommandReceived,
    /// Opening the outbound connection
    Connecting,
    /// UDP relay granted, holding the TCP connection
    UdpAssociated,
    /// Pumping bytes
    Relaying,
    /// Done
    Closed,
}

impl Socks5State {
    /// Whether `next` may follow this state
    pub fn can_transition(self, next: Socks5State) -> bool {
        use Socks5State::*;
        matches!(
            (self, next),
            (_, Closed)
                | (Init, MethodNegotiated)
                | (MethodNegotiated, Authenticating)
                | (MethodNegotiated, CommandReceived)
                | (Authenticating, CommandReceived)
                | (CommandReceived, Connecting)
                | (CommandReceived, UdpAssociated)
                | (Connecting, Relaying)
        )
    }

    /// Move to `next`, rejecting out-of-order steps
    pub fn transition(&mut self, next: Socks5State) -> Result<(), Socks5Error> {
        if !self.can_transition(next) {
            return Err(Socks5Error::GeneralFailure);
        }
        tracing::trace!("SOCKS5 state {:?} -> {:?}", self, next);
        *self = next;
        Ok(())
    }
}
