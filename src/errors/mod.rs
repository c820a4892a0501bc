//! Error type definitions for the stalker-proxy application
//!
//! The portal, EPG and streaming subsystems each surface their own error
//! enum; services compose them through `anyhow` and the web layer maps
//! them onto HTTP statuses.

use thiserror::Error;

/// Errors surfaced by the portal client.
///
/// Only `Unreachable` and `Throttled` are retried; `AuthFailed` surfaces
/// immediately and `NoLink` drives dispatcher failover.
#[derive(Error, Debug)]
pub enum PortalError {
    /// Network/transport failure talking to the portal
    #[error("portal unreachable: {0}")]
    Unreachable(String),

    /// Protocol-level authentication failure (HTTP error, missing token
    /// field, or a response shape the handshake cannot interpret)
    #[error("portal authentication failed: {0}")]
    AuthFailed(String),

    /// Portal asked us to back off (HTTP 429/503)
    #[error("portal throttled (HTTP {0})")]
    Throttled(u16),

    /// Portal returned a sentinel null/empty cmd for a channel
    #[error("portal returned no stream link")]
    NoLink,
}

impl PortalError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PortalError::Unreachable(_) | PortalError::Throttled(_)
        )
    }
}

/// Errors from the EPG source manager
#[derive(Error, Debug)]
pub enum EpgError {
    /// Download failure for a source URL
    #[error("EPG download failed for {url}: {message}")]
    Download { url: String, message: String },

    /// Malformed XMLTV at element boundary. The offending element is
    /// skipped; this variant only surfaces when the whole document is
    /// unreadable.
    #[error("XMLTV parse error: {0}")]
    Parse(String),

    /// Programme store failure
    #[error("EPG store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Errors from the stream dispatcher
#[derive(Error, Debug)]
pub enum StreamError {
    /// No MAC in the selection domain had a free slot
    #[error("no free MAC for portal {portal_id} channel {channel_id}")]
    NoFreeMac {
        portal_id: String,
        channel_id: String,
    },

    /// FFmpeg produced no bytes within the startup grace period
    #[error("stream start timed out after {0:?}")]
    StartTimeout(std::time::Duration),

    /// Every candidate MAC was tried and none yielded a working stream
    #[error("all MACs exhausted for portal {portal_id} channel {channel_id}")]
    Exhausted {
        portal_id: String,
        channel_id: String,
    },

    /// Channel is unknown to the catalog
    #[error("unknown channel {channel_id} on portal {portal_id}")]
    UnknownChannel {
        portal_id: String,
        channel_id: String,
    },
}
