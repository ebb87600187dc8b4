//! Blocking HTTP/1.1 server engine.
//!
//! One lightweight thread serves one connection; each exchange flows
//! through a bounded channel reader, byte-at-a-time head parsers, the
//! route/action registries, the response framer and the channel writer.
//! There is no event loop and no async scheduling.
//!
//! ```no_run
//! use mazurka_core::prelude::*;
//!
//! fn main() -> std::io::Result<()> {
//!     mazurka_core::logging::init();
//!     let server = Server::create(Config::default());
//!     server
//!         .add_route(Route::new("/hello/:name").unwrap().get(
//!             |_req: &mut Request, params: &Params| -> Result<Response> {
//!                 let name = params.get("name").unwrap_or("world");
//!                 Ok(Response::text(format!("hello {name}")))
//!             },
//!         ))
//!         .expect("fresh route table");
//!     server.start("127.0.0.1:8080")
//! }
//! ```

pub mod body;
pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod framer;
pub mod headers;
pub mod logging;
pub mod parser;
pub mod reader;
pub mod registry;
pub mod request;
pub mod response;
pub mod route;
pub mod server;
pub mod timeout;
pub mod trie;
pub mod writer;

pub use config::Config;
pub use error::{Error, Result};
pub use headers::Headers;
pub use request::{HttpVersion, Request, Target};
pub use response::Response;
pub use route::{Method, Params, Route};
pub use server::Server;

pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::headers::Headers;
    pub use crate::request::Request;
    pub use crate::response::Response;
    pub use crate::route::{Method, Params, Route};
    pub use crate::server::Server;
}
