pub mod gateway;
pub mod model_client;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod storage;
