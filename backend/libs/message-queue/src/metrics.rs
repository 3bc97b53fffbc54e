use prometheus::{IntCounter, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct QueueMetrics {
    pub published: IntCounter,
    pub publish_failures: IntCounter,
    pub dispatched: IntCounter,
    pub handler_failures: IntCounter,
    pub commit_failures: IntCounter,
    pub poll_errors: IntCounter,
}

impl QueueMetrics {
    /// Counters labelled with the consumer group, registered on the default registry.
    pub fn new(group: &str) -> Self {
        let registry = prometheus::default_registry();

        let counter = |name: &str, help: &str| {
            IntCounter::with_opts(Opts::new(name, help).const_label("group", group.to_string()))
                .expect("valid metric opts for message queue counter")
        };

        let published = counter(
            "mq_published_total",
            "Records committed by the transactional publisher",
        );
        let publish_failures = counter(
            "mq_publish_failures_total",
            "Publishes whose transaction was aborted",
        );
        let dispatched = counter(
            "mq_dispatched_total",
            "Inbound messages run through the dispatch path",
        );
        let handler_failures = counter(
            "mq_handler_failures_total",
            "Handler invocations that failed, timed out or panicked",
        );
        let commit_failures = counter(
            "mq_commit_failures_total",
            "Offset commits that failed after dispatch",
        );
        let poll_errors = counter(
            "mq_poll_errors_total",
            "Broker error events observed by the poll loop",
        );

        for metric in [
            Box::new(published.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(publish_failures.clone()),
            Box::new(dispatched.clone()),
            Box::new(handler_failures.clone()),
            Box::new(commit_failures.clone()),
            Box::new(poll_errors.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register message queue metric: {}", e);
            }
        }

        Self {
            published,
            publish_failures,
            dispatched,
            handler_failures,
            commit_failures,
            poll_errors,
        }
    }
}
