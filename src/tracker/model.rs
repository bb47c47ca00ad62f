use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Debug)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub remember: bool,
}

#[derive(Deserialize, Debug)]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Serialize, Debug)]
pub struct WatchedRequest {
    pub watched: bool,
}

#[derive(Serialize, Debug)]
pub struct DiaryRequest {
    pub watched_at: DateTime<Utc>,
}
