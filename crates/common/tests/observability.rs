use common::config::LogFormat;
use metrics_exporter_prometheus::PrometheusBuilder;

#[test]
fn error_events_are_counted_for_both_formats() {
    for format in [LogFormat::Json, LogFormat::Pretty] {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let (dispatch, _otel_guard) =
                common::observability::build_dispatch("test-service", "info", format);

            tracing::dispatcher::with_default(&dispatch, || {
                tracing::info!("not counted");
                tracing::error!(job = "sync_markets", "boom");
            });
        });

        let rendered = handle.render();
        assert!(
            rendered.contains("tracing_error_events 1"),
            "expected exactly one error event for {format:?}, got:\n{rendered}"
        );
    }
}
