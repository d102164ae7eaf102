mod server;
mod transport;

pub use server::ConnectionLimits;
pub use server::MethodHandler;
pub use server::RpcServer;
pub use transport::ClientWriter;
pub use transport::TransportError;
pub use transport::UnixSocketConnection;
