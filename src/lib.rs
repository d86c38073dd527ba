//! Peer-wire protocol client: handshakes with a single peer, learns which
//! pieces it has, and downloads one verified piece into a pre-sized file.

pub mod config;
pub mod dispatcher;
pub mod downloader;
pub mod error;
pub mod framer;
pub mod peer;
pub mod piece;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod torrent;

pub use error::ApplicationError;
pub use session::SessionContext;
pub use torrent::Metadata;
