//! Owned request/response values and the network seam.

mod network;
mod types;

pub use network::{Network, ReqwestNetwork};
pub use types::{Request, Response};
