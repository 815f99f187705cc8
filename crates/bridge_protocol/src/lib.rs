pub mod bus;
pub mod codec;
pub mod correlation;
pub mod error;
pub mod listeners;
pub mod message;
pub mod request;
pub mod transport;

pub use bus::{Bus, BusConfig, CallHandler, NoRoutes};
pub use error::BusError;
pub use message::{EventCategory, Message};
pub use request::{AgentDescriptor, HandlerGroup, Request};
