use std::path::PathBuf;
use std::sync::Arc;

use crate::dht::Dht;
use crate::peer::{PeerId, StreamDialer};
use crate::storage::{FileStorage, StorageFactory};

/// A predicate over torrent names; returning true drops the torrent at
/// metadata install time.
pub type NameFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Client-wide configuration. `Default` gives a working downloader
/// writing into the current directory.
#[derive(Clone)]
pub struct ClientConfig {
    /// Where torrent data lands (the default storage factory roots
    /// here).
    pub data_dir: PathBuf,
    /// Where client state lives: blocklist, banned infohashes, cached
    /// metainfo.
    pub config_dir: PathBuf,
    pub disable_trackers: bool,
    pub disable_tcp: bool,
    /// Refuse to serve chunk requests and advertise accordingly.
    pub no_upload: bool,
    /// Skip loading `<config_dir>/blocklist` at startup.
    pub no_default_blocklist: bool,
    /// Skip the metainfo cache entirely.
    pub disable_metainfo_cache: bool,
    /// Fixed peer id; random per client instance when unset.
    pub peer_id: Option<PeerId>,
    /// `host:port` to listen on; [`crate::constants::DEFAULT_LISTEN_ADDR`]
    /// when unset.
    pub listen_addr: Option<String>,
    /// An external DHT server to announce through; none disables DHT.
    pub dht: Option<Arc<dyn Dht>>,
    /// Opens storage per torrent; defaults to [`FileStorage`] under
    /// `data_dir`.
    pub storage_factory: Option<StorageFactory>,
    /// Optional name veto applied when metadata installs. Off by
    /// default.
    pub name_filter: Option<NameFilter>,
    /// A uTP dialer to race against TCP; none disables uTP.
    pub utp_dialer: Option<Arc<dyn StreamDialer>>,
    /// Ceiling on unverified bytes per torrent; zero means unlimited.
    pub max_unverified_bytes: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let config_dir = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config/shoal");
        Self {
            data_dir: PathBuf::from("."),
            config_dir,
            disable_trackers: false,
            disable_tcp: false,
            no_upload: false,
            no_default_blocklist: false,
            disable_metainfo_cache: false,
            peer_id: None,
            listen_addr: None,
            dht: None,
            storage_factory: None,
            name_filter: None,
            utp_dialer: None,
            max_unverified_bytes: 0,
        }
    }
}

impl ClientConfig {
    /// The storage factory in force: the configured one, or
    /// file-backed storage under `data_dir`.
    pub fn storage_factory(&self) -> StorageFactory {
        match &self.storage_factory {
            Some(factory) => Arc::clone(factory),
            None => {
                let data_dir = self.data_dir.clone();
                Arc::new(move |info| {
                    FileStorage::open(&data_dir, info).map(|s| Arc::new(s) as _)
                })
            }
        }
    }
}
