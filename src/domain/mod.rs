//! Pure domain types: no I/O, no broker, no database.
pub mod aggregates;
pub mod events;
pub mod value_objects;
