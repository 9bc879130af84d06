//! Client-side session layer over the libkubo engine.
//! The engine is reached only through the [`Engine`] trait; everything above it is plain Rust.

pub mod config;
pub mod error;
pub mod ffi;
pub mod files;
pub mod gateway;
pub mod node;
pub mod p2p;
pub mod peers;
pub mod pubsub;
pub mod wire;

mod context;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use config::NodeOptions;
pub use error::{Error, Result};
pub use gateway::{CloseArgs, Engine};
pub use node::NodeSession;
pub use p2p::{Addr, CloseFilter, StreamMount};
pub use pubsub::{Messages, PubSub, Subscription};
pub use wire::{Connections, Mapping, Message, Stream};

#[cfg(feature = "libkubo")]
pub use ffi::KuboLibrary;
