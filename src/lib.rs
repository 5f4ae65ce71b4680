pub mod catalog;
pub mod codec;
pub mod commands;
pub mod connection;
pub mod discovery;
pub mod flags;
pub mod identity;
pub mod modbus;
pub mod output;
pub mod sync;
pub mod timestamp;
pub mod topics;
pub mod transport;
