pub mod access;
pub mod file;
pub mod health;
pub mod reward;
pub mod user;
pub mod webhook;
