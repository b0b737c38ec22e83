pub mod connection;
pub mod devices;
pub mod ice;
pub mod media;
pub mod monitor;
pub mod negotiator;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::{RtcTransport, RtcTransportFactory};
pub use devices::{SampleDevices, SampleTrack};
pub use ice::{CandidateBuffer, Disposition};
pub use media::{LocalTrack, MediaDevices, MediaHandle, MediaSource};
pub use monitor::{ConnectivityMonitor, MonitorAction};
pub use negotiator::Negotiator;
pub use state::{FailureReason, SessionState, SessionTransition};
pub use transport::{Transport, TransportEvent, TransportFactory};
pub use types::{
    IceCandidate, LinkState, MediaKind, RemoteTrack, Role, ServerConfig, SessionDescription,
    TrackKind,
};
