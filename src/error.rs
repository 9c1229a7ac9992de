//! Error types for Sockrelay
//!
//! Every failure in the relay is scoped to a single session or a single
//! tunnel client. The variants below mirror how a failure is handled:
//! protocol errors get a reply code, cipher errors are logged quietly,
//! upstream errors go through the reconnect policy.

use std::io;
use thiserror::Error;

/// Main error type for Sockrelay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication error (bad credentials or IP limit)
    #[error("Authentication error: {0}")]
    Auth(String),

    /// SOCKS5 protocol error
    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] Socks5Error),

    /// Cipher error
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// Upstream connect error
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// A tunnel proxy name or port is already claimed
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Tunnel client has no live control connection
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Tunnel client is already connected
    #[error("Client already connected")]
    AlreadyConnected,

    /// Tunnel client has a connect attempt in flight
    #[error("Client is connecting")]
    Connecting,
}

/// SOCKS5 specific errors
#[derive(Error, Debug)]
pub enum Socks5Error {
    /// Unsupported SOCKS version
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// No acceptable authentication method
    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    /// Authentication failed
    #[error("Authentication failed")]
    AuthFailed,

    /// Command not supported
    #[error("Command not supported: {0}")]
    CommandNotSupported(u8),

    /// Address type not supported
    #[error("Address type not supported: {0}")]
    AddressTypeNotSupported(u8),

    /// Connection not allowed
    #[error("Connection not allowed")]
    NotAllowed,

    /// General SOCKS server failure
    #[error("General SOCKS server failure")]
    GeneralFailure,

    /// Invalid address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid domain name
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),
}

/// Shadowsocks AEAD errors
///
/// Kept apart from IO errors: a decrypt failure usually means a wrong
/// password or a scanner, and is logged at reduced severity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Unknown cipher method
    #[error("Unsupported cipher method: {0}")]
    UnsupportedMethod(String),

    /// Authentication tag mismatch
    #[error("Decryption failed")]
    Decrypt,

    /// Encryption failed
    #[error("Encryption failed")]
    Encrypt,

    /// Header or chunk is malformed
    #[error("Malformed data: {0}")]
    Malformed(String),
}

impl CipherError {
    /// Check whether an anyhow error chain carries a cipher failure
    pub fn is_cipher_error(err: &anyhow::Error) -> bool {
        err.chain().any(|e| {
            e.downcast_ref::<CipherError>().is_some()
                || matches!(e.downcast_ref::<RelayError>(), Some(RelayError::Cipher(_)))
        })
    }
}

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl From<Socks5ReplyCode> for u8 {
    fn from(code: Socks5ReplyCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for Socks5ReplyCode {
    type Error = Socks5Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Socks5ReplyCode::Succeeded),
            0x01 => Ok(Socks5ReplyCode::GeneralFailure),
            0x02 => Ok(Socks5ReplyCode::ConnectionNotAllowed),
            0x03 => Ok(Socks5ReplyCode::NetworkUnreachable),
            0x04 => Ok(Socks5ReplyCode::HostUnreachable),
            0x05 => Ok(Socks5ReplyCode::ConnectionRefused),
            0x06 => Ok(Socks5ReplyCode::TtlExpired),
            0x07 => Ok(Socks5ReplyCode::CommandNotSupported),
            0x08 => Ok(Socks5ReplyCode::AddressTypeNotSupported),
            _ => Err(Socks5Error::GeneralFailure),
        }
    }
}

impl From<&io::Error> for Socks5ReplyCode {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Socks5ReplyCode::ConnectionRefused,
            io::ErrorKind::TimedOut => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::AddrNotAvailable => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::PermissionDenied => Socks5ReplyCode::ConnectionNotAllowed,
            _ => Socks5ReplyCode::GeneralFailure,
        }
    }
}

impl From<&Socks5Error> for Socks5ReplyCode {
    fn from(err: &Socks5Error) -> Self {
        match err {
            Socks5Error::CommandNotSupported(_) => Socks5ReplyCode::CommandNotSupported,
            Socks5Error::AddressTypeNotSupported(_) => Socks5ReplyCode::AddressTypeNotSupported,
            Socks5Error::NotAllowed | Socks5Error::AuthFailed => {
                Socks5ReplyCode::ConnectionNotAllowed
            }
            Socks5Error::InvalidAddress(_) | Socks5Error::InvalidDomain(_) => {
                Socks5ReplyCode::HostUnreachable
            }
            _ => Socks5ReplyCode::GeneralFailure,
        }
    }
}

impl Socks5ReplyCode {
    /// Pick the reply code for the first SOCKS5 or IO error in the chain
    pub fn for_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(e) = cause.downcast_ref::<Socks5Error>() {
                return e.into();
            }
            if let Some(RelayError::Socks5(e)) = cause.downcast_ref::<RelayError>() {
                return e.into();
            }
            if let Some(e) = cause.downcast_ref::<io::Error>() {
                return e.into();
            }
        }
        Socks5ReplyCode::GeneralFailure
    }
}
