use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ==== Frame Loop Metrics ====
    pub static ref ANPR_ACTIVE_CAMERAS: IntGauge = {
        let metric = IntGauge::new("anpr_active_cameras", "Number of running camera pipelines")
            .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref ANPR_FRAMES_PROCESSED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("anpr_frames_processed_total", "Total number of frames processed"),
            &["camera", "status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref ANPR_DETECTIONS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "anpr_detections_total",
                "Total number of plate regions accepted from the detector",
            ),
            &["camera"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref ANPR_REMOTE_FRAMES_DROPPED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "anpr_remote_frames_dropped_total",
                "Pushed frames dropped because the camera queue was full",
            ),
            &["camera"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Tracker Metrics ====
    pub static ref ANPR_ACTIVE_TRACKS: IntGaugeVec = {
        let metric = IntGaugeVec::new(
            Opts::new("anpr_active_tracks", "Number of live plate candidates"),
            &["camera"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref ANPR_TRACKS_CREATED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("anpr_tracks_created_total", "Total number of plate candidates created"),
            &["camera"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref ANPR_TRACKS_EVICTED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "anpr_tracks_evicted_total",
                "Total number of plate candidates removed after timing out",
            ),
            &["camera"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== OCR Metrics ====
    pub static ref ANPR_OCR_LATENCY: HistogramVec = {
        let metric = HistogramVec::new(
            HistogramOpts::new("anpr_ocr_latency_seconds", "Latency of OCR reads")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0]),
            &["engine"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref ANPR_OCR_FAILURES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("anpr_ocr_failures_total", "Total number of failed OCR reads"),
            &["engine"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Save Dispatch Metrics ====
    pub static ref ANPR_SAVES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("anpr_saves_total", "Total number of plate save decisions"),
            &["camera", "trigger", "status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref ANPR_DISPATCH_LATENCY: Histogram = {
        let metric = Histogram::with_opts(
            HistogramOpts::new(
                "anpr_dispatch_duration_seconds",
                "Duration of save finalisation (second OCR, storage, record, notification)",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Encode all registered metrics in the Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
