use std::time::Duration;

/// Optional metrics collaborator for the Topic Manager. Kept as a trait rather than a concrete
/// exporter dependency so embedding applications can wire it to whatever metrics stack they
/// already run.
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &str, value: u64);

    fn record_latency(&self, name: &str, duration: Duration);
}

/// Composes the admin implementation's class name and the cluster's bootstrap servers into a
/// metric name prefix, so metrics from two `TopicManager`s pointed at different clusters never
/// collide under one name.
pub fn metric_name(admin_class_name: &str, bootstrap_servers: &str, suffix: &str) -> String {
    format!("{admin_class_name}.{bootstrap_servers}.{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_name_composes_class_and_bootstrap() {
        let name = metric_name("RdKafkaAdminClient", "broker:9092", "create_topic");
        assert_eq!(name, "RdKafkaAdminClient.broker:9092.create_topic");
    }
}
