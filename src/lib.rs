pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use commands::CallController;
pub use config::CallConfig;
pub use error::{CallError, MediaError, NegotiationError, SignalingError, TransportError};
pub use peer::{
    LinkState, MediaDevices, MediaKind, RemoteTrack, SampleDevices, ServerConfig, SessionState,
    TrackKind,
};
pub use session::{Session, SessionContext, SessionObserver};
pub use signaling::{Envelope, SignalingMessage, SignalingSink};
