mod invoker;
mod request;
mod response;
mod server;

pub use invoker::Invoker;
pub use request::AsyncHandler;
pub use request::CommandHandler;
pub use request::Request;
pub use response::Responder;
pub use server::Server;
