use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rulewatch_core::collaborators::{JobSubmitter, SubmitReceipt};
use rulewatch_core::error::{EngineError, Result};
use tracing::info;
use uuid::Uuid;

/// Job submitter that queues filled job files in a local spool directory,
/// one subdirectory per tenant.
#[derive(Debug, Clone)]
pub struct SpoolJobSubmitter {
    root: PathBuf,
}

impl SpoolJobSubmitter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn job_path(&self, tenant: &str, job_id: &str) -> PathBuf {
        self.root.join(tenant).join(format!("{job_id}.job"))
    }
}

#[async_trait]
impl JobSubmitter for SpoolJobSubmitter {
    async fn submit(&self, job_file: &Path, owner: &str, tenant: &str) -> Result<SubmitReceipt> {
        let job_id = Uuid::now_v7().to_string();
        let target = self.job_path(tenant, &job_id);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| EngineError::io(parent, err))?;
        }
        fs::copy(job_file, &target).map_err(|err| {
            EngineError::Submit(format!("cannot spool {}: {err}", job_file.display()))
        })?;

        info!(target: "rulewatch::actions", job_id = %job_id, owner, tenant, spool = %target.display(), "job spooled");
        Ok(SubmitReceipt {
            message: format!("job {job_id} queued"),
            job_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_job_file_into_tenant_spool() {
        let tmp = tempfile::tempdir().unwrap();
        let job = tmp.path().join("job.mRSL");
        fs::write(&job, "::EXECUTE::\necho hi\n").unwrap();
        let submitter = SpoolJobSubmitter::new(tmp.path().join("spool"));

        let first = submitter.submit(&job, "alice", "alpha/sub").await.unwrap();
        let second = submitter.submit(&job, "alice", "alpha/sub").await.unwrap();

        assert_ne!(first.job_id, second.job_id);
        let spooled = submitter.job_path("alpha/sub", &first.job_id);
        assert_eq!(fs::read_to_string(spooled).unwrap(), "::EXECUTE::\necho hi\n");
    }

    #[tokio::test]
    async fn missing_job_file_is_a_submit_error() {
        let tmp = tempfile::tempdir().unwrap();
        let submitter = SpoolJobSubmitter::new(tmp.path());
        let err = submitter
            .submit(&tmp.path().join("absent"), "alice", "alpha")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Submit(_)));
    }
}
