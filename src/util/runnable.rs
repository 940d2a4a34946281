use super::async_flag;
use async_trait::async_trait;

/// Long-running component. `run` loops until `exit_flag` fires and must
/// release every resource it acquired before returning.
#[async_trait]
pub trait Runnable: Send + Sync {
    async fn run(
        &self,
        exit_flag: async_flag::Receiver,
    ) -> Exited;
}

#[derive(Debug)]
pub struct Exited;
