pub mod broker;
pub mod health;
pub mod identity;
pub mod memory;
pub mod push;
pub mod rbmq;
pub mod redis;
