pub mod errors;
pub mod events;
pub mod images;
pub mod posts;
