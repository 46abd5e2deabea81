pub mod client;
pub mod client_types;
pub mod conversation;
pub mod duration_serde;
pub mod tls;
pub mod traits;

pub use client::*;
pub use client_types::*;
pub use conversation::*;
pub use tls::TlsOptions;
pub use traits::{AsyncReadAndWrite, BoxedAsyncReadAndWrite};
