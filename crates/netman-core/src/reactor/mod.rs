//! The reactor: pollers, the event loop that runs them, the acceptor that
//! feeds them, and the heartbeat that prunes what they own.

pub mod acceptor;
pub mod event_loop;
pub mod heartbeat;
pub mod poller;

pub use acceptor::{Acceptor, AcceptorContext, AcceptorError, AcceptorHandle, AcceptorState};
pub use event_loop::EventLoop;
pub use heartbeat::Heartbeat;
pub use poller::{Poller, PollerError, PollerHandle, PollerId};
