//! Bulk ingest endpoint URL builders

/// Build the ingest jobs collection URL
pub fn jobs_url(instance_url: &str, api_version: &str) -> String {
    format!(
        "{}/services/data/v{}/jobs/ingest",
        instance_url.trim_end_matches('/'),
        api_version
    )
}

/// Build a single job URL
pub fn job_url(instance_url: &str, api_version: &str, job_id: &str) -> String {
    format!("{}/{}", jobs_url(instance_url, api_version), job_id)
}

/// Build the CSV upload URL for a job
pub fn batches_url(instance_url: &str, api_version: &str, job_id: &str) -> String {
    format!("{}/batches", job_url(instance_url, api_version, job_id))
}

/// Build the successful results URL
pub fn successful_results_url(instance_url: &str, api_version: &str, job_id: &str) -> String {
    format!("{}/successfulResults/", job_url(instance_url, api_version, job_id))
}

/// Build the failed results URL
pub fn failed_results_url(instance_url: &str, api_version: &str, job_id: &str) -> String {
    format!("{}/failedResults/", job_url(instance_url, api_version, job_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_urls() {
        assert_eq!(
            jobs_url("https://acme.my.salesforce.com/", "59.0"),
            "https://acme.my.salesforce.com/services/data/v59.0/jobs/ingest"
        );
        assert_eq!(
            batches_url("https://acme.my.salesforce.com", "59.0", "750x"),
            "https://acme.my.salesforce.com/services/data/v59.0/jobs/ingest/750x/batches"
        );
        assert!(failed_results_url("https://a", "59.0", "750x").ends_with("/750x/failedResults/"));
    }
}
