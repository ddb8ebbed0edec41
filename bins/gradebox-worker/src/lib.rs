pub mod analysis;
pub mod config;
pub mod docker;
pub mod engine;
pub mod evaluator;
pub mod executor;
pub mod harness;
pub mod runner;
pub mod worker;

#[cfg(test)]
mod testing;

pub use analysis::{AnalysisScheduler, ChatModel, OpenAiChatModel};
pub use config::RuntimeRegistry;
pub use docker::DockerRuntime;
pub use engine::{ContainerRuntime, RuntimeProfile, SandboxPolicy, SeccompPolicy};
pub use executor::CodeDeployment;
pub use runner::{IsolatedRunner, SandboxContext, TestRunner};
pub use worker::{JobQueue, RedisJobQueue};
