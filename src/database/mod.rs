pub mod index;
pub mod repo;
pub mod schema;
