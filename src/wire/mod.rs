pub mod ack;
pub mod codec;
pub mod framing;
pub mod session;
