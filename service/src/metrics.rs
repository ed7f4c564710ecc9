//! Descriptions for the counters every Stayflow crate records.
//!
//! Call [`describe_metrics`] once after installing a recorder so the exporter shows help
//! text for each series.

use metrics::describe_counter;

/// Register help text for all Stayflow counters.
pub fn describe_metrics() {
    // Saga
    describe_counter!("saga.started", "Create-accommodation sagas started");
    describe_counter!("saga.completed", "Sagas that reached a terminal state, by outcome");
    describe_counter!("saga.commands.published", "Saga commands published, by type");
    describe_counter!("saga.commands.failed", "Saga commands that could not be published");
    describe_counter!("saga.replies.published", "Participant replies published, by type");
    describe_counter!("saga.replies.failed", "Participant replies that could not be published");
    describe_counter!("saga.replies.ignored", "Replies for unknown or finished sagas");
    describe_counter!("saga.abandoned", "Sagas dropped after their first publish timed out");
    describe_counter!(
        "saga.commands.orphaned",
        "Commands published for sagas that were already abandoned"
    );
    describe_counter!(
        "saga.participant.redelivered",
        "Commands answered from the deduplication record"
    );
    describe_counter!("saga.accommodations", "Accommodation verdicts applied, by action");
    describe_counter!("saga.accommodations.failed", "Accommodation verdicts that failed");
    describe_counter!("saga.messages.undecodable", "Saga messages that could not be decoded");
    describe_counter!("saga.messages.unhandled", "Saga messages with no handler");
    describe_counter!("saga.handler.failures", "Saga handlers that returned an error");

    // Command side
    describe_counter!("commands.appended", "Activity commands appended, by command");
    describe_counter!("commands.rejected", "Activity commands that failed validation");
    describe_counter!("commands.failed", "Activity commands the event store refused");
    describe_counter!("event_store.appended", "Events appended to the event store");
    describe_counter!("event_store.conflicts", "Conditional appends that lost a race");

    // Query side
    describe_counter!("projection.events", "Events applied to a projection");
    describe_counter!("projection.skipped", "Events a projection skipped, by reason");
    describe_counter!("projection.failed", "Events a projection failed to apply");
    describe_counter!("consumer.reconnects", "Subscription reconnect attempts");
    describe_counter!("subscription.parked", "Events parked after exhausting retries");
    describe_counter!("subscription.parked.replayed", "Parked events replayed by an operator");
    describe_counter!("subscription.parked.discarded", "Parked events discarded by an operator");

    // Messaging and runtime
    describe_counter!("channel.published", "Messages published, by subject");
    describe_counter!("channel.publish_failed", "Messages that could not be published");
    describe_counter!("channel.redelivered", "Nacked messages delivered again, by subject");
    describe_counter!("channel.abandoned", "Messages committed after exhausting redeliveries");
    describe_counter!("store.actions.processed", "Actions reduced by a state machine");
    describe_counter!("store.actions.rejected", "Actions refused during shutdown");
    describe_counter!("store.effects.executed", "Effects executed, by type");

    tracing::debug!("Metric descriptions registered");
}
