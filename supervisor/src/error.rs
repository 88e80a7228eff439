use anyhow::Error;

/// Sentinel returned by provisioner job-status checks when the backing job
/// has exhausted its retries. The supervising operation must be marked
/// failed rather than retried.
#[derive(Debug, thiserror::Error)]
#[error("job backoff limit reached")]
pub struct JobBackoffLimitReached;

/// True when `err` carries the backoff sentinel anywhere in its chain.
pub fn is_backoff_limit_reached(err: &Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<JobBackoffLimitReached>().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn sentinel_survives_context_wrapping() {
        let err: Error = Error::from(JobBackoffLimitReached);
        assert!(is_backoff_limit_reached(&err));

        let wrapped = Err::<(), _>(err)
            .context("checking backup status")
            .unwrap_err();
        assert!(is_backoff_limit_reached(&wrapped));

        let other = anyhow::anyhow!("connection refused");
        assert!(!is_backoff_limit_reached(&other));
    }
}
