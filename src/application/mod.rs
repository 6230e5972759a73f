pub mod bridge;
pub mod catalog;
pub mod credentials;
pub mod endpoints;
pub mod naming;
pub mod persistence;
