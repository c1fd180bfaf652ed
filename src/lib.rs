//! FastCGI protocol engine and WSGI-style gateway for synchronous
//! request handlers.

pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod nvpair;
pub mod pool;
pub mod record;
pub mod server;

pub use connection::serve_connection;
pub use error::FcgiError;
pub use gateway::{build_environ, http_headers, Application, Environ, FnApplication, IterBody, ResponseBody, StartResponse};
pub use pool::WorkerPool;
pub use record::{ProtocolStatus, Record, Role};
