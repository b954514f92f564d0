// Request-level middleware shared by the HTTP surface

pub mod cors;

pub use cors::*;
