//! Timing around each named daily operation.
//!
//! Every phase run is logged as "<label> took <ms> ms". When a sink is
//! injected the elapsed time is also forwarded to it; tests run without one.

use std::time::{Duration, Instant};

pub trait MetricsSink {
    fn record_duration(&self, label: &str, elapsed: Duration);
}

/// Run `f`, log how long it took, and report the duration to `sink`.
pub fn timed<T>(label: &str, sink: Option<&dyn MetricsSink>, f: impl FnOnce() -> T) -> T {
    let started = Instant::now();
    let value = f();
    let elapsed = started.elapsed();
    log::info!("{label} took {} ms", elapsed.as_millis());
    if let Some(sink) = sink {
        sink.record_duration(label, elapsed);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder(RefCell<Vec<String>>);

    impl MetricsSink for Recorder {
        fn record_duration(&self, label: &str, _elapsed: Duration) {
            self.0.borrow_mut().push(label.to_string());
        }
    }

    #[test]
    fn forwards_label_and_returns_value() {
        let recorder = Recorder::default();
        let value = timed("march.enroll_patients", Some(&recorder), || 7);
        assert_eq!(value, 7);
        assert_eq!(*recorder.0.borrow(), vec!["march.enroll_patients".to_string()]);
        assert_eq!(timed("no_sink", None, || "ok"), "ok");
    }
}
