//! Tracker announce clients (BEP-3 HTTP, BEP-15 UDP).
//!
//! The core speaks one contract: hand an [`AnnounceRequest`] to a
//! [`TrackerClient`] and get an [`AnnounceResponse`] with an interval
//! and a peer list. The transport is chosen by URL scheme; anything
//! else is a typed [`TrackerError::BadScheme`].

mod error;
mod http;
mod response;
mod udp;

#[cfg(test)]
mod tests;

use std::time::Duration;

pub use error::TrackerError;
pub use response::{parse_compact_peers, parse_compact_peers6, AnnounceResponse};

use crate::metainfo::InfoHash;

/// Default per-announce deadline. Callers with their own deadline pass
/// it to [`TrackerClient::announce_with_timeout`].
pub const DEFAULT_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

/// The announce event field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnounceEvent {
    #[default]
    None,
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    pub fn query_value(self) -> &'static str {
        match self {
            AnnounceEvent::None => "",
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }

    pub fn udp_value(self) -> u32 {
        match self {
            AnnounceEvent::None => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }
}

/// Everything a tracker needs to know about our participation.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    /// None lets the tracker pick (sent as -1 over UDP).
    pub num_want: Option<i32>,
}

enum Transport {
    Http,
    Udp(udp::UdpTracker),
}

/// One tracker endpoint. UDP clients cache their connection id between
/// announces until it expires.
pub struct TrackerClient {
    url: String,
    transport: Transport,
}

impl TrackerClient {
    pub fn new(url: &str) -> Result<Self, TrackerError> {
        let transport = match url.split(':').next().unwrap_or("") {
            "http" | "https" => Transport::Http,
            "udp" => Transport::Udp(udp::UdpTracker::new(url)?),
            _ => return Err(TrackerError::BadScheme(url.to_string())),
        };
        Ok(Self {
            url: url.to_string(),
            transport,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn announce(
        &self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        self.announce_with_timeout(request, DEFAULT_ANNOUNCE_TIMEOUT)
            .await
    }

    pub async fn announce_with_timeout(
        &self,
        request: &AnnounceRequest,
        deadline: Duration,
    ) -> Result<AnnounceResponse, TrackerError> {
        let work = async {
            match &self.transport {
                Transport::Http => http::announce(&self.url, request).await,
                Transport::Udp(udp) => udp.announce(request).await,
            }
        };
        tokio::time::timeout(deadline, work)
            .await
            .map_err(|_| TrackerError::Timeout)?
    }

    /// Host portion of the URL, for blocklist checks before announcing.
    pub fn host(&self) -> Option<&str> {
        let rest = self.url.split_once("://")?.1;
        let authority = rest.split(['/', '?']).next()?;
        let host = match authority.rsplit_once(':') {
            Some((h, maybe_port)) if maybe_port.chars().all(|c| c.is_ascii_digit()) => h,
            _ => authority,
        };
        Some(host)
    }
}
