pub mod client;
pub mod codec;
pub mod command;
pub mod connection;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod pool;
pub mod subscribe;

pub use client::{Client, ClientConfig, ServerAddr};
pub use command::Command;
pub use connection::Connection;
pub use error::{Error, Result};
pub use frame::Reply;
pub use pipeline::Pipeline;
pub use pool::Pool;
pub use subscribe::{PushEvent, Subscriber};
