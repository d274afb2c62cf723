pub mod auth;

pub use auth::{basic_auth, decode_basic, Credentials};
