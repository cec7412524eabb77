//! Wire protocol
//!
//! Frame codec, socket endpoints, the start/data/response channel and the
//! message types that travel over it.

pub mod channel;
pub mod frame;
pub mod net;
pub mod types;
