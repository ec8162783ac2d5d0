pub mod dispatcher;
pub mod logging;
pub mod server;
