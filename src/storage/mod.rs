pub mod layout;
pub mod naming;
