pub mod error;
pub mod request;
pub mod response;


pub use error::{CancelReason, ConnectionFailure, FailureKind, Result, TransportError};
pub use request::HttpRequest;
pub use response::HttpResponse;
