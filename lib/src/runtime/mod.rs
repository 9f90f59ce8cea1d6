use crate::aggregate::CampaignAggregator;
use crate::campaign::Campaign;
use crate::collaborators::{GeneratorContext, GeneratorError};
use crate::execution::ExecutionRequest;
use crate::scheduler::PendingResult;
use crate::target::CampaignTarget;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::*;

const GENERATOR_BACKOFF: Duration = Duration::from_millis(100);

/// A submitted request on its way to the result collector.
#[derive(Debug)]
pub(crate) struct Dispatched {
    pub target: CampaignTarget,
    pub payload: Vec<u8>,
    pub pending: PendingResult,
}

/// Pulls payloads for one target and submits them until the generator runs dry or the
/// campaign is stopped.
pub(crate) async fn run_target(
    campaign: Arc<Campaign>,
    target: CampaignTarget,
    results: UnboundedSender<Dispatched>,
) {
    let Some(spec) = campaign.registry.spec(&target.protocol) else {
        error!("No protocol {} for {}", target.protocol, target.name);
        return;
    };
    let generator = campaign.collaborators.generator.clone();
    let settings = campaign.settings;
    let mut issued: u64 = 0;
    let mut failures = 0;
    let exhausted = loop {
        if !campaign.wait_while_paused().await {
            break false;
        }
        let ctx = GeneratorContext {
            campaign_id: &campaign.id,
            issued,
        };
        let next = tokio::select! {
            next = timeout(settings.generator_timeout, generator.next_payload(&target, ctx)) => {
                next.unwrap_or(Err(GeneratorError::TimedOut(settings.generator_timeout)))
            }
            _ = campaign.cancel.cancelled() => break false,
        };
        let payload = match next {
            Ok(Some(payload)) => {
                failures = 0;
                payload
            }
            Ok(None) => break true,
            Err(e) => {
                failures += 1;
                warn!("Generator failed for {} ({failures} in a row): {e}", target.name);
                if failures >= settings.max_generator_failures {
                    error!("Giving up on {} after {failures} generator failures", target.name);
                    break true;
                }
                // Back-off before asking again
                sleep(GENERATOR_BACKOFF).await;
                continue;
            }
        };

        let session = match campaign.session_for(&target, &spec, &payload.params).await {
            Ok(session) => session,
            Err(e) => {
                warn!("No session for {}: {e}", target.name);
                continue;
            }
        };
        let request = ExecutionRequest::new(campaign.next_request_id(), target.clone(), payload.bytes.clone())
            .with_session(session)
            .with_params(payload.params);
        let pending = tokio::select! {
            pending = campaign.scheduler.submit(request) => pending,
            _ = campaign.cancel.cancelled() => break false,
        };
        issued += 1;
        let dispatched = Dispatched {
            target: target.clone(),
            payload: payload.bytes,
            pending,
        };
        if results.send(dispatched).is_err() {
            break false;
        }
    };
    if exhausted {
        campaign.aggregator.mark_exhausted(&target.name);
    }
    info!("Worker for {} finished after {issued} payloads", target.name);
}

/// Logs the execution rate every `every` until `stop` fires.
pub async fn iterations_tracker(aggregator: Arc<CampaignAggregator>, every: Duration, stop: CancellationToken) {
    let mut last_executions = aggregator.executions();
    loop {
        let start = Instant::now();
        tokio::select! {
            _ = sleep(every) => {}
            _ = stop.cancelled() => break,
        }
        let executions = aggregator.executions();
        let elapsed = start.elapsed().as_millis().max(1);
        let it_per_second = executions.saturating_sub(last_executions) as f64 / elapsed as f64 * 1000f64;
        info!("{:.1} it/s", it_per_second);
        last_executions = executions;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Endpoint;

    #[tokio::test(start_paused = true)]
    async fn tracker_stops_on_cancel() {
        let target = CampaignTarget::new("plc", "modbus", Endpoint::new("127.0.0.1", 502));
        let aggregator = Arc::new(CampaignAggregator::new("campaign-0001", &[target]));
        let stop = CancellationToken::new();
        let tracker = tokio::spawn(iterations_tracker(aggregator, Duration::from_secs(1), stop.clone()));
        sleep(Duration::from_secs(3)).await;
        assert!(!tracker.is_finished());
        stop.cancel();
        tracker.await.unwrap();
    }
}
