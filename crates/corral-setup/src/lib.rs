pub mod deploy;
pub mod resolver;
pub mod runner;
pub mod step;
pub mod steps;
pub mod template;

pub use deploy::{DeployOutcome, DeployReport, Deployer, NodeDeploy};
pub use resolver::{local_addresses, resolve_role, resolve_with_override};
pub use runner::{NodeStepResult, StepOutcome, StepRecord, StepReport, StepRunner};
pub use step::{Step, StepContext};
pub use steps::builtin_steps;
pub use template::{render, TemplateArtifact, TemplateContext, TemplateId};
