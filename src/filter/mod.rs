pub mod gate;
pub mod patterns;
