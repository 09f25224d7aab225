//! Optimistic-concurrency update loop for CanaryRelease status.
//!
//! Multiple writers (cluster controller, proxy agent) append conditions and
//! patch status fields concurrently; every update goes through a
//! fetch-modify-push loop that retries on version conflicts.

use kube::api::{Api, PostParams};
use tokio_retry::strategy::{jitter, FixedInterval};

use crate::crd::{CanaryRelease, CanaryReleaseCondition};

/// Conflict retry: 5 steps, 10 ms apart (plus jitter).
const RETRY_STEPS: usize = 5;
const RETRY_BASE_MILLIS: u64 = 10;

/// True for an HTTP 409 from the API server.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Fetch the CanaryRelease, apply `mutate` to a fresh copy, and push the
/// status subresource, retrying on conflict.
///
/// Non-conflict errors are returned immediately.
pub async fn update_status_with_retries<F>(
    api: &Api<CanaryRelease>,
    name: &str,
    mut mutate: F,
) -> Result<CanaryRelease, kube::Error>
where
    F: FnMut(&mut CanaryRelease),
{
    let backoffs: Vec<_> = FixedInterval::from_millis(RETRY_BASE_MILLIS)
        .map(jitter)
        .take(RETRY_STEPS)
        .collect();

    let mut attempt = 0;
    loop {
        let mut cr = api.get(name).await?;
        mutate(&mut cr);

        let data = serde_json::to_vec(&cr).map_err(kube::Error::SerdeError)?;
        match api.replace_status(name, &PostParams::default(), data).await {
            Ok(updated) => return Ok(updated),
            Err(err) if is_conflict(&err) && attempt < backoffs.len() => {
                tokio::time::sleep(backoffs[attempt]).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Append a condition to the CanaryRelease's log.
pub async fn add_condition(
    api: &Api<CanaryRelease>,
    name: &str,
    condition: CanaryReleaseCondition,
) -> Result<(), kube::Error> {
    update_status_with_retries(api, name, |cr| {
        let status = cr.status.get_or_insert_with(Default::default);
        status.conditions.push(condition.clone());
    })
    .await
    .map(|_| ())
}

/// Like [`add_condition`], but skips the write when the latest logged
/// condition already carries the same reason and message. Keeps steady-state
/// resyncs from mutating the CR.
pub async fn add_condition_if_new(
    api: &Api<CanaryRelease>,
    name: &str,
    condition: CanaryReleaseCondition,
) -> Result<(), kube::Error> {
    let current = api.get(name).await?;
    let last = current
        .status
        .as_ref()
        .and_then(|s| s.conditions.last());
    if let Some(last) = last {
        if last.reason == condition.reason && last.message == condition.message {
            return Ok(());
        }
    }
    add_condition(api, name, condition).await
}
