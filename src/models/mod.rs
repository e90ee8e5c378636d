pub mod fcm;
pub mod health;
pub mod message;
pub mod principal;
pub mod retry;
pub mod rate_limit;
pub mod response;
pub mod status;
pub mod topology;
pub mod validation;
