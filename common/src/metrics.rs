use metrics::{describe_counter, describe_gauge, gauge};

pub fn component_info_metric(name: &'static str) {
    static NAME: &str = "detprocess_component_info";

    describe_gauge!(NAME, "Basic information about the component");

    let git_rev = option_env!("GIT_VERSION").unwrap_or("unknown");
    gauge!(NAME, "component" => name, "git_version" => git_rev).set(1);
}

pub fn describe_metrics() {
    describe_counter!(names::TRIGGERS_DETECTED, "Channel triggers emitted after pileup suppression");
    describe_counter!(names::EVENTS_BUILT, "Coincident events built");
    describe_counter!(names::BLOCKS_PROCESSED, "Waveform blocks read and processed");
    describe_counter!(names::PARTITIONS_FLUSHED, "Output partitions flushed to a sink");
    describe_counter!(names::FAILURES, "Failures by kind");
}

pub mod names {
    pub const TRIGGERS_DETECTED: &str = "detprocess_triggers_detected";
    pub const EVENTS_BUILT: &str = "detprocess_events_built";
    pub const BLOCKS_PROCESSED: &str = "detprocess_blocks_processed";
    pub const PARTITIONS_FLUSHED: &str = "detprocess_partitions_flushed";
    pub const FAILURES: &str = "detprocess_failures";
}

pub mod failures {
    #[derive(Debug, Clone, Eq, Hash, PartialEq, strum::Display)]
    pub enum FailureKind {
        #[strum(to_string = "source_read_failed")]
        SourceReadFailed,
        #[strum(to_string = "sink_flush_failed")]
        SinkFlushFailed,
    }

    // Label building function
    pub fn get_label(failure_kind: FailureKind) -> (&'static str, String) {
        ("failure_kind", failure_kind.to_string())
    }
}
