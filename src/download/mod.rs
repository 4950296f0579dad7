pub mod fetch;
pub mod page;
pub mod retry;
