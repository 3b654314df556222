//! Request and response bodies for the gateway API.

use serde::{Deserialize, Serialize};

/// Query string of `GET /code`.
#[derive(Debug, Deserialize)]
pub struct CodeQuery {
    pub number: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CodeResponse {
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}
