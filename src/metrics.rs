use tracing::trace;

// Lightweight metrics helpers emitted as trace events under `hermes.metrics`.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "hermes.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "hermes.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn stage_outcome(stage: &'static str, outcome: &'static str) {
    trace!(
        target = "hermes.metrics",
        stage = stage,
        outcome = outcome,
        "stage_outcomes_total_inc"
    );
}

pub fn wave_dispatched(wave: u64, dispatched: usize) {
    trace!(
        target = "hermes.metrics",
        wave = wave,
        dispatched = dispatched as u64,
        "wave_dispatched"
    );
}
