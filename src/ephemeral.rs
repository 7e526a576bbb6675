//! One-shot execution: open, run, close, with no registry entry.

use crate::environment::{
    EnvironmentError, EnvironmentFactory, ExecutionEnvironment, ExecutionOutput, Language,
};
use crate::error::{ServiceError, ServiceResult};
use std::sync::Arc;
use tracing::{info, warn};

/// An opened environment that is closed when dropped.
///
/// Only constructed by a successful `open`, so a failed open never leads to
/// a close. Dropping during a panic in `run` still closes.
pub struct OpenEnvironment {
    environment: Box<dyn ExecutionEnvironment>,
}

impl OpenEnvironment {
    pub fn open(mut environment: Box<dyn ExecutionEnvironment>) -> Result<Self, EnvironmentError> {
        environment.open()?;
        Ok(Self { environment })
    }

    pub fn run(
        &mut self,
        code: &str,
        libraries: &[String],
    ) -> Result<ExecutionOutput, EnvironmentError> {
        self.environment.run(code, libraries)
    }
}

impl Drop for OpenEnvironment {
    fn drop(&mut self) {
        if let Err(e) = self.environment.close() {
            warn!(error = %e, "Failed to close ephemeral environment");
        }
    }
}

/// Open, run and close in one blocking call.
pub fn run_scoped(
    environment: Box<dyn ExecutionEnvironment>,
    code: &str,
    libraries: &[String],
) -> ServiceResult<ExecutionOutput> {
    let mut environment =
        OpenEnvironment::open(environment).map_err(ServiceError::EnvironmentSetup)?;
    environment.run(code, libraries).map_err(ServiceError::Execution)
}

pub struct EphemeralExecutor {
    environments: Arc<dyn EnvironmentFactory>,
}

impl EphemeralExecutor {
    pub fn new(environments: Arc<dyn EnvironmentFactory>) -> Self {
        Self { environments }
    }

    pub async fn execute(
        &self,
        code: String,
        language: Language,
        keep_template: bool,
        libraries: Vec<String>,
    ) -> ServiceResult<ExecutionOutput> {
        info!(%language, keep_template, libraries = libraries.len(), "Ephemeral execution");
        let environment = self.environments.create(language, keep_template);

        let output =
            tokio::task::spawn_blocking(move || run_scoped(environment, &code, &libraries))
                .await??;

        info!(%language, exit_code = output.exit_code, "Ephemeral execution finished");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEnvironmentFactory, Probe};

    fn executor(factory: FakeEnvironmentFactory) -> EphemeralExecutor {
        EphemeralExecutor::new(Arc::new(factory))
    }

    #[tokio::test]
    async fn success_closes_once() {
        let probe = Probe::default();
        let ephemeral = executor(FakeEnvironmentFactory::new(probe.clone()));

        let output = ephemeral
            .execute("print('Hello, World!')".into(), Language::Python, false, vec![])
            .await
            .unwrap();

        assert_eq!(output.stdout, "Hello, World!\n");
        assert_eq!(output.stderr, "");
        assert_eq!(output.exit_code, 0);
        assert_eq!((probe.opens(), probe.runs(), probe.closes()), (1, 1, 1));
    }

    #[tokio::test]
    async fn libraries_reach_the_environment() {
        let probe = Probe::default();
        let ephemeral = executor(FakeEnvironmentFactory::new(probe.clone()));

        ephemeral
            .execute(
                "print(3 + 4)".into(),
                Language::Python,
                false,
                vec!["numpy".into(), "pandas".into()],
            )
            .await
            .unwrap();

        assert_eq!(probe.last_libraries(), vec!["numpy", "pandas"]);
    }

    #[tokio::test]
    async fn run_error_still_closes_once() {
        let probe = Probe::default();
        let ephemeral = executor(FakeEnvironmentFactory::new(probe.clone()).failing_run());

        let err = ephemeral
            .execute("bad code".into(), Language::Python, false, vec![])
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Execution(_)));
        assert_eq!((probe.opens(), probe.closes()), (1, 1));
    }

    #[tokio::test]
    async fn run_panic_still_closes_once() {
        let probe = Probe::default();
        let ephemeral = executor(FakeEnvironmentFactory::new(probe.clone()).panicking_run());

        let err = ephemeral
            .execute("print(1)".into(), Language::Python, false, vec![])
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Internal(_)));
        assert_eq!((probe.opens(), probe.closes()), (1, 1));
    }

    #[tokio::test]
    async fn close_failure_does_not_mask_result() {
        let probe = Probe::default();
        let ephemeral = executor(FakeEnvironmentFactory::new(probe.clone()).failing_close());

        let output = ephemeral
            .execute("print('hi')".into(), Language::Python, false, vec![])
            .await
            .unwrap();

        assert_eq!(output.stdout, "hi\n");
        assert_eq!(output.exit_code, 0);
        assert_eq!(probe.closes(), 1);
    }

    #[tokio::test]
    async fn open_failure_skips_close() {
        let probe = Probe::default();
        let ephemeral = executor(FakeEnvironmentFactory::new(probe.clone()).failing_open());

        let err = ephemeral
            .execute("print(1)".into(), Language::Python, false, vec![])
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::EnvironmentSetup(_)));
        assert_eq!((probe.opens(), probe.runs(), probe.closes()), (1, 0, 0));
    }

    #[tokio::test]
    async fn failing_program_is_a_normal_result() {
        let probe = Probe::default();
        let ephemeral = executor(FakeEnvironmentFactory::new(probe.clone()));

        let output = ephemeral
            .execute("print(undefined_name)".into(), Language::Python, false, vec![])
            .await
            .unwrap();

        assert_ne!(output.exit_code, 0);
        assert!(output.stderr.contains("NameError"));
        assert_eq!(probe.closes(), 1);
    }
}
