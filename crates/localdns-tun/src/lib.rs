pub mod buffer;
pub mod dns_intercept;
pub mod error;
pub mod flow;
pub mod packet;
pub mod selector;

#[cfg(unix)]
pub mod device;
#[cfg(unix)]
pub mod protect;
#[cfg(unix)]
pub mod pump;
#[cfg(unix)]
pub mod relay;
#[cfg(unix)]
pub mod tcp;
#[cfg(unix)]
pub mod udp;

#[cfg(unix)]
pub use relay::{start, RelayContext, RelayHandle};
