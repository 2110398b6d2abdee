//! HTTP layer: request preparation, connections, transfers and push.

pub mod conn;
pub mod push;
pub mod request;
pub mod response;
pub mod transfer;

pub use request::{PreparedRequest, RequestOptions};
pub use response::ResponseHead;
