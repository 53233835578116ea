pub mod connection;
pub mod peer;
pub mod sessions;

pub use peer::Peer;
pub use sessions::Sessions;
pub use connection::{SessionContext, SessionEvent, SessionHandle};
