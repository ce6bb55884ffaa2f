//! Outbound connections the relay uses to reach back in

pub mod callback;
pub mod dialer;
pub mod pool;

pub use callback::CallbackConnector;
pub use dialer::{BoxedRelayStream, RelayDialer, RelayStream, TlsRelayDialer};
pub use pool::{
    PoolHandle, PoolSlots, ReversePool, MIN_IDLE_LIFETIME, POOL_WATERMARK, REDIAL_DELAY,
};
