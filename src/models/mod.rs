pub mod transcript;
pub mod websocket;
