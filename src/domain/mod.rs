//! Domain layer public interface.
//!
//! This module defines the abstractions shared by the multiplexer, the
//! iterator bridge and the concrete transports. None of them reference a
//! specific broker client library.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod options;
mod transport;

// --- Option re-exports ---

pub use options::{
    //
    ConsumeOptions,
    Exchange,
    ExchangeKind,
    PublishOptions,
    Queue,
    QueueOptions,
    SubscribeOptions,
};

// --- Transport domain re-exports ---

pub use transport::{
    //
    Delivery,
    Disposer,
    MessageHandler,
    Transport,
    TransportBase,
    TransportPtr,
};
