pub mod chat;
pub mod connection;
pub mod dispatcher;
pub mod notify;
