use owl_core::job::JobListing;
use owl_core::{ApiRequest, Job, JobPage, Result, Transport};

pub async fn get_job<T: Transport + ?Sized>(transport: &T, job_id: u64) -> Result<Job> {
    let req = ApiRequest::get("get_job", format!("api/jobs/{job_id}"))
        .target(format!("job #{job_id}"));
    let ctx = req.context();
    let resp = transport.execute(req).await?.error_for_status(&ctx)?;
    resp.json(&ctx)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobListQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

pub async fn list_jobs<T: Transport + ?Sized>(
    transport: &T,
    query: &JobListQuery,
) -> Result<JobPage> {
    let mut req = ApiRequest::get("list_jobs", "api/jobs").target("jobs");
    if let Some(p) = query.page {
        req = req.query("page", p);
    }
    if let Some(s) = query.page_size {
        req = req.query("page_size", s);
    }
    let ctx = req.context();
    let resp = transport.execute(req).await?.error_for_status(&ctx)?;
    let listing: JobListing = resp.json(&ctx)?;
    Ok(listing.into())
}

/// Raw bytes of the sample a file job was created for.
pub async fn download_sample<T: Transport + ?Sized>(transport: &T, job_id: u64) -> Result<Vec<u8>> {
    let req = ApiRequest::get("download_sample", format!("api/jobs/{job_id}/download_sample"))
        .target(format!("job #{job_id}"));
    let ctx = req.context();
    let resp = transport.execute(req).await?.error_for_status(&ctx)?;
    Ok(resp.body)
}
