mod rest;

pub use rest::{create_rest_api, ApiError};
