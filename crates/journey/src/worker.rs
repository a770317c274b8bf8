//! Background task that runs executor passes on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::executor::FlowExecutor;

pub struct FlowWorker {
    executor: Arc<FlowExecutor>,
    node_id: String,
    interval: Duration,
}

impl FlowWorker {
    pub fn new(executor: Arc<FlowExecutor>, node_id: impl Into<String>) -> Self {
        let interval = Duration::from_millis(executor.config().poll_interval_ms.max(1));
        Self {
            executor,
            node_id: node_id.into(),
            interval,
        }
    }

    /// Spawns the polling loop. It stops once `shutdown` flips to `true` or
    /// its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                node_id = %self.node_id,
                interval_ms = self.interval.as_millis() as u64,
                "Flow worker started"
            );
            let mut interval = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let executor = Arc::clone(&self.executor);
                        let pass = tokio::task::spawn_blocking(move || executor.run_pass(Utc::now()));
                        if let Err(e) = pass.await {
                            warn!(node_id = %self.node_id, error = %e, "Executor pass panicked");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(node_id = %self.node_id, "Flow worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorServices;
    use crate::store::{EnrollmentStore, FlowStore};
    use crate::triggers::TriggerMatcher;
    use crate::types::*;
    use mailflow_cdp::ContactStore;
    use mailflow_channels::{EngagementTracker, OutboxMailer, TemplateLibrary};
    use mailflow_core::config::AppConfig;
    use mailflow_core::types::Contact;

    #[tokio::test]
    async fn test_worker_runs_passes_until_shutdown() {
        let mut config = AppConfig::default();
        config.executor.poll_interval_ms = 5;
        let flows = Arc::new(FlowStore::new());
        let enrollments = Arc::new(EnrollmentStore::new());
        let contacts = Arc::new(ContactStore::new());
        let mailer = Arc::new(OutboxMailer::default());
        let matcher = Arc::new(TriggerMatcher::new(
            Arc::clone(&flows),
            Arc::clone(&enrollments),
            contacts.clone(),
            "worker-test",
        ));
        let executor = Arc::new(FlowExecutor::new(
            &config,
            Arc::clone(&flows),
            Arc::clone(&enrollments),
            Arc::clone(&matcher),
            ExecutorServices {
                contacts: contacts.clone(),
                mailer: mailer.clone(),
                engagement: Arc::new(EngagementTracker::new()),
                templates: Arc::new(TemplateLibrary::new()),
            },
        ));

        let mut flow = Flow::new(
            "welcome",
            vec![
                FlowStep::new(
                    "t",
                    StepConfig::Trigger(TriggerConfig::new(TriggerType::List, "news")),
                )
                .then("e1"),
                FlowStep::new(
                    "e1",
                    StepConfig::Action(EmailActionConfig::with_html("Hi", "<p>hi</p>")),
                ),
            ],
        );
        flow.status = FlowStatus::Active;
        flows.insert(flow).unwrap();
        contacts.upsert(Contact::new("w@example.com")).unwrap();
        matcher.handle_event(&TriggerEvent::list_added("w@example.com", "news"), Utc::now());

        let (tx, rx) = watch::channel(false);
        let handle = FlowWorker::new(executor, "worker-test").spawn(rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(mailer.sent_count(), 1);
    }
}
