pub mod digest;
pub mod fs;
pub mod http;
pub mod retry;
