//! Network module for the peer mesh
//!
//! Handles wire framing and the full-mesh connection manager.

mod error;
mod frame;
mod mesh;

pub use error::NetworkError;
pub use frame::{read_frame, Frame, FrameKind, HEADER_LEN, MAX_PAYLOAD_LEN};
pub use mesh::{FrameSink, Mesh};
