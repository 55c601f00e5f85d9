pub mod codec;
pub mod connection;
pub mod handshake;
pub mod message;
pub mod mux;
pub mod payload;
pub mod request;
