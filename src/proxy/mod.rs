pub mod conn;
pub mod protocol;
pub mod server;



pub use protocol::{BackendMessage, FrontendMessage, StartupMessage};
pub use server::PgProxy;
