pub mod connection_handle;
pub mod connection_manager;
pub mod extension;
pub mod handshake;
pub mod info;
pub mod message;

pub use connection_handle::SessionHandle;
pub use connection_manager::{SessionContext, SessionEvent};
