//! Wire protocol shared by every device in the mesh
//!
//! Envelope types live in [`messages`]; topic layout and identifier rules in [`topics`].

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
