pub mod entity;

pub use entity::register_entity_handlers;
