use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;

pub struct Metrics {
    request_counter: Counter<u64>,
    prediction_counter: Counter<u64>,
    prediction_duration: Histogram<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("lymphoma_detector");
        global::set_meter_provider(provider);

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let prediction_counter = meter
            .u64_counter("predictions_total")
            .with_description("Predictions per predicted label")
            .build();

        let prediction_duration = meter
            .u64_histogram("prediction_duration_ms")
            .with_boundaries(duration_boundaries(&[
                (0, 100, 10),
                (100, 1000, 100),
                (1000, 5000, 1000),
            ]))
            .with_description("Duration of prediction operations in milliseconds")
            .build();

        Ok(Metrics {
            request_counter,
            prediction_counter,
            prediction_duration,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = [KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_prediction(&self, label: &str, duration_ms: u64, route: &str) {
        self.prediction_counter
            .add(1, &[KeyValue::new("label", label.to_string())]);
        self.prediction_duration
            .record(duration_ms, &[KeyValue::new("route", route.to_string())]);
    }
}

/// Concatenates `(start, end, step)` ranges into sorted, deduplicated bucket bounds.
fn duration_boundaries(ranges: &[(u64, u64, usize)]) -> Vec<f64> {
    let mut bounds: Vec<u64> = ranges
        .iter()
        .flat_map(|&(start, end, step)| (start..=end).step_by(step))
        .collect();
    bounds.sort_unstable();
    bounds.dedup();
    bounds.into_iter().map(|b| b as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_duration_boundaries() {
        let get = duration_boundaries(&[(0, 20, 10), (20, 60, 20), (60, 160, 100)]);
        let expected = vec![0.0, 10.0, 20.0, 40.0, 60.0, 160.0];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_metrics_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("/predict");
        metrics.record_prediction("FL", 42, "/predict");

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let exposition = String::from_utf8(buffer).unwrap();

        assert!(exposition.contains("requests_total"));
        assert!(exposition.contains("predictions_total"));
        assert!(exposition.contains("label=\"FL\""));
        assert!(exposition.contains("prediction_duration_ms"));
    }
}
