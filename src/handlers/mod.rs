//! 핸들러 모듈

pub mod chat;
pub mod session;

pub use chat::*;
pub use session::*;
