pub mod environments;
pub mod health;
pub mod models;
pub mod repos;
pub mod secrets;
pub mod sessions;
