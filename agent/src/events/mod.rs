//! Operation event bus

pub mod bus;

pub use bus::{EventBus, OperationWatch, Subscription};
