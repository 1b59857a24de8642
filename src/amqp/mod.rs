//! Helpers for connecting to a RabbitMq broker via [`lapin`].

mod adapter;
pub mod configuration;
pub mod convenience;
mod factory;

pub use adapter::{LapinChannel, LapinConnection};
pub use factory::ConnectionFactory;

pub use lapin::{options, types, BasicProperties, ExchangeKind};
