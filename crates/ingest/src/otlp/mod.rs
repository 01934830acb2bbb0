pub mod decode;
pub mod grpc;
pub mod http;
