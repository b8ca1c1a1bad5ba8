pub mod events;
pub mod providers;
pub mod records;
pub mod settings;
