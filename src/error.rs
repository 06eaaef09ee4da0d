//! Error types for Tunrats
//!
//! This module defines all custom error types used throughout the application.

use std::fmt;
use std::io;
use thiserror::Error;

/// Main error type for Tunrats operations
#[derive(Error, Debug)]
pub enum TunratsError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or unsupported packet
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// DNS message error
    #[error("DNS error: {0}")]
    Dns(String),

    /// Filter construction error
    #[error("Filter error: {0}")]
    Filter(String),

    /// The fake address pool has no address that can be handed out
    #[error("Fake address pool exhausted")]
    PoolExhausted,

    /// Tunnel or direct handler error
    #[error("Handler error: {0}")]
    Handler(String),

    /// Packet source error
    #[error("Device error: {0}")]
    Device(String),

    /// Flow stack error
    #[error("Stack error: {0}")]
    Stack(String),

    /// A pipeline setup stage failed
    #[error("{stage} setup failed: {source:#}")]
    Setup {
        /// Stage that failed
        stage: SetupStage,
        /// Underlying cause
        source: anyhow::Error,
    },
}

impl TunratsError {
    /// Wrap an error as a failure of the given setup stage
    pub fn setup(stage: SetupStage, source: impl Into<anyhow::Error>) -> Self {
        TunratsError::Setup {
            stage,
            source: source.into(),
        }
    }

    /// Stage of a setup failure, if this is one
    pub fn stage(&self) -> Option<SetupStage> {
        match self {
            TunratsError::Setup { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Stages of pipeline construction, in acquisition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetupStage {
    /// DNS resolver and upstream transport
    Resolver,
    /// Tunnel handler
    Handler,
    /// Packet source and interface configuration
    Device,
    /// Domain rule tree
    Rules,
    /// IP and process filters
    Filters,
    /// Packet-to-flow stack
    Stack,
    /// Route table entries
    Routes,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStage::Resolver => "resolver",
            SetupStage::Handler => "handler",
            SetupStage::Device => "device",
            SetupStage::Rules => "rules",
            SetupStage::Filters => "filters",
            SetupStage::Stack => "stack",
            SetupStage::Routes => "routes",
        };
        f.write_str(name)
    }
}

/// Packet parsing errors
///
/// These never leave the stack; they are counted and the packet is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer shorter than the header it claims to hold
    #[error("Packet truncated: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required
        need: usize,
        /// Bytes available
        have: usize,
    },

    /// Unknown IP version nibble
    #[error("Unsupported IP version: {0}")]
    UnsupportedVersion(u8),

    /// Transport protocol other than TCP/UDP
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(u8),

    /// Fragmented IPv4 packet
    #[error("Fragmented packet")]
    Fragmented,

    /// Header length fields are inconsistent
    #[error("Invalid header: {0}")]
    InvalidHeader(&'static str),

    /// Checksum did not verify
    #[error("Checksum mismatch in {0} header")]
    Checksum(&'static str),
}

/// Convenience result alias
pub type Result<T, E = TunratsError> = std::result::Result<T, E>;
