//! Client for the live cooking relay

mod transport;

pub use transport::{
    ClientSessionTransport, FrameSender, SessionParams, TransportEvent, live_cooking_url,
};
