//! Per-listener SMTP serving: the accept loop (§4.G), the per-connection
//! state machine (§4.G), and the plain/TLS transport abstraction that lets
//! `STARTTLS` swap one for the other mid-connection.
//!
//! Generalizes the teacher's single hardcoded `Server`/`SmtpProtocol` pair
//! (one listener, a five-state machine, one webhook target) into one
//! `Server` per configured listener, each driving the full
//! Greeting/Cmd/Data/StartTLS/Shutdown machine against the backend gateway
//! and allowed-hosts matcher instead of a single string comparison.

mod server;
mod session;
mod stream;

pub use server::Server;
pub use session::ClientState;
pub use stream::Stream;
