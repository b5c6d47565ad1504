pub mod kafka;
pub mod rabbitmq;
