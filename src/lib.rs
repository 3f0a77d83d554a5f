pub mod app;
pub mod definition;
pub mod dispatch;
pub mod orchestration;
pub mod shared;
