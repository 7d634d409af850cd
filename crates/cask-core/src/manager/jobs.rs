use std::sync::Arc;

use tracing::{error, info, warn};

use cask_domain::api::{CommonResult, JobInfo, SearchParameters, SearchResult};
use cask_domain::{codes, FuzzyReference, Reference};
use uuid::Uuid;

use crate::manager::{reject, PackageManager};

fn job_info(id: String) -> JobInfo {
    JobInfo {
        id,
        code: codes::SUCCESS,
        message: String::new(),
    }
}

impl PackageManager {
    /// Query the remote for packages matching a fuzzy id. Returns a job id
    /// immediately; the result arrives as a `SearchFinished` event.
    pub fn search(&self, params: SearchParameters) -> Result<JobInfo, CommonResult> {
        let fuzzy = FuzzyReference::parse(&params.id).map_err(reject)?;
        let job_id = Uuid::new_v4().to_string();

        let inner = Arc::clone(self.inner());
        let id = job_id.clone();
        self.inner().search_queue.run(move || {
            match inner.repo.list_remote(&fuzzy) {
                Ok(packages) => inner.sink.search_finished(
                    &id,
                    &SearchResult {
                        packages,
                        code: codes::QUERY_SUCCESS,
                        message: String::new(),
                    },
                ),
                Err(err) => {
                    warn!(%fuzzy, %err, "remote search failed");
                    inner.sink.search_finished(
                        &id,
                        &SearchResult {
                            packages: Vec::new(),
                            code: codes::QUERY_FAILED,
                            message: err.to_string(),
                        },
                    );
                }
            };
        });

        Ok(job_info(job_id))
    }

    /// Remove every unreferenced base/runtime layer. Returns a job id
    /// immediately; the removed list arrives as a `PruneFinished` event.
    #[must_use]
    pub fn prune(&self) -> JobInfo {
        let job_id = Uuid::new_v4().to_string();

        let inner = Arc::clone(self.inner());
        let id = job_id.clone();
        self.inner().prune_queue.run(move || {
            match inner.prune_packages() {
                Ok(removed) => inner.sink.prune_finished(
                    &id,
                    &SearchResult {
                        packages: removed,
                        code: codes::SUCCESS,
                        message: String::new(),
                    },
                ),
                Err(err) => {
                    error!(%err, "prune failed");
                    inner.sink.prune_finished(
                        &id,
                        &SearchResult {
                            packages: Vec::new(),
                            code: codes::QUERY_FAILED,
                            message: err.to_string(),
                        },
                    );
                }
            };
        });

        job_info(job_id)
    }

    /// Regenerate the caches of an installed reference. Returns a job id
    /// immediately; completion arrives as a `GenerateCacheFinished` event.
    pub fn generate_cache(&self, reference: &str) -> Result<JobInfo, CommonResult> {
        let reference = Reference::parse(reference).map_err(reject)?;
        let job_id = Uuid::new_v4().to_string();

        let inner = Arc::clone(self.inner());
        let id = job_id.clone();
        self.inner().cache_queue.run(move || {
            info!(%reference, "generating cache");
            match inner.generate_cache(&reference) {
                Ok(()) => inner.sink.generate_cache_finished(&id, true),
                Err(err) => {
                    error!(%reference, %err, "failed to generate cache");
                    inner.sink.generate_cache_finished(&id, false);
                }
            }
        });

        Ok(job_info(job_id))
    }
}
