pub mod mimetype;
pub mod normalize;
