pub mod backend;
pub mod document;
pub mod driver;
pub mod transport;

pub use backend::{Backend, LspBackend, SessionOptions};
pub use document::{Document, TextChange};
pub use driver::{DriverOptions, SessionDriver};
