pub mod accounts;
pub mod admin;
pub mod auth;
pub mod chat;
pub mod error;
pub mod middleware;
pub mod social;
