use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Stream setup error: {0}")]
    Stream(String),

    #[error("Consumer setup error: {0}")]
    Consumer(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Acknowledge error: {0}")]
    Ack(String),

    #[error("Delivery not found: {0}")]
    NotFound(String),

    #[error("Subscription is closed")]
    Closed,
}
