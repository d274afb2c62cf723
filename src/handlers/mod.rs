pub mod hello;

pub use hello::{hello, AUTHENTICATED_USER};
