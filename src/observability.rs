use biometrics::{Collector, Counter, Moments};

pub(crate) static STREAM_CHUNKS: Counter = Counter::new("directive_chat.stream.chunks");
pub(crate) static STREAM_ERRORS: Counter = Counter::new("directive_chat.stream.errors");
pub(crate) static STREAM_CANCELLED: Counter = Counter::new("directive_chat.stream.cancelled");
pub(crate) static STREAM_DURATION: Moments =
    Moments::new("directive_chat.stream.duration_seconds");

pub(crate) static DIRECTIVES_SEEN: Counter = Counter::new("directive_chat.directives.seen");
pub(crate) static DIRECTIVES_DUPLICATE: Counter =
    Counter::new("directive_chat.directives.duplicate");
pub(crate) static DEBOUNCE_RESTARTS: Counter =
    Counter::new("directive_chat.directives.debounce_restarts");
pub(crate) static DIRECTIVES_DISPATCHED: Counter =
    Counter::new("directive_chat.directives.dispatched");
pub(crate) static RESULTS_DISCARDED: Counter =
    Counter::new("directive_chat.directives.results_discarded");

pub(crate) static HANDLER_ERRORS: Counter = Counter::new("directive_chat.handler.errors");
pub(crate) static HANDLER_DURATION: Moments =
    Moments::new("directive_chat.handler.duration_seconds");
pub(crate) static SEARCH_REFUSED: Counter = Counter::new("directive_chat.search.refused");
pub(crate) static MIRROR_FAILURES: Counter = Counter::new("directive_chat.sandbox.mirror_failures");

pub(crate) static FOLLOW_UPS: Counter = Counter::new("directive_chat.session.follow_ups");
pub(crate) static REGENERATIONS: Counter = Counter::new("directive_chat.session.regenerations");
pub(crate) static PERSIST_FAILURES: Counter = Counter::new("directive_chat.store.persist_failures");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&STREAM_CHUNKS);
    collector.register_counter(&STREAM_ERRORS);
    collector.register_counter(&STREAM_CANCELLED);
    collector.register_moments(&STREAM_DURATION);

    collector.register_counter(&DIRECTIVES_SEEN);
    collector.register_counter(&DIRECTIVES_DUPLICATE);
    collector.register_counter(&DEBOUNCE_RESTARTS);
    collector.register_counter(&DIRECTIVES_DISPATCHED);
    collector.register_counter(&RESULTS_DISCARDED);

    collector.register_counter(&HANDLER_ERRORS);
    collector.register_moments(&HANDLER_DURATION);
    collector.register_counter(&SEARCH_REFUSED);
    collector.register_counter(&MIRROR_FAILURES);

    collector.register_counter(&FOLLOW_UPS);
    collector.register_counter(&REGENERATIONS);
    collector.register_counter(&PERSIST_FAILURES);
}
