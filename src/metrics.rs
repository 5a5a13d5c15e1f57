use lazy_static::lazy_static;
use prometheus::{
    opts, register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    pub static ref UPSTREAM_REQUESTS_COUNT: IntCounterVec = register_int_counter_vec!(
        opts!("upstream_requests_count", "requests relayed to upstreams"),
        &["host"]
    )
    .expect("Can't create metric");
    pub static ref UPSTREAM_ERRORS_COUNT: IntCounterVec = register_int_counter_vec!(
        opts!("upstream_errors_count", "upstreams errors"),
        &["host"]
    )
    .expect("Can't create metric");
    pub static ref UPSTREAM_TIMINGS_SECONDS: HistogramVec = register_histogram_vec!(
        "upstream_timings_seconds",
        "upstream timings_seconds",
        &["host"],
        vec![0.0001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
    )
    .expect("Can't create metric");
    pub static ref NO_BACKEND_COUNT: IntCounter = register_int_counter!(
        "no_backend_count",
        "requests rejected because no upstream was known"
    )
    .expect("Can't create metric");
    pub static ref POLICY_SWITCHES_COUNT: IntCounterVec = register_int_counter_vec!(
        opts!("policy_switches_count", "balancing policy switches"),
        &["policy"]
    )
    .expect("Can't create metric");
}

pub fn gather() -> crate::Result<Vec<u8>> {
    let mut buffer = Vec::new();

    let encoder = TextEncoder::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather() {
        NO_BACKEND_COUNT.inc();
        UPSTREAM_ERRORS_COUNT.with_label_values(&["a:80"]).inc();

        let text = String::from_utf8(gather().unwrap()).unwrap();
        assert!(text.contains("no_backend_count"));
        assert!(text.contains(r#"upstream_errors_count{host="a:80"}"#));
    }
}
