//! Optional tracing-subscriber bootstrap for applications embedding this
//! client. The engine itself only ever emits `tracing` events
//! (`src/client.rs`, `src/handlers.rs`); installing a subscriber is an
//! application concern the library doesn't impose on its caller, but a
//! ready-made default — matching the teacher's `bin/server.rs::set_up_logging`
//! — saves every embedder from re-deriving the same boilerplate.
//!
//! Without the `otel` feature, [`init`] installs a plain `fmt` subscriber
//! reading `RUST_LOG`. With it, spans are additionally exported over OTLP
//! with an X-Ray-compatible ID generator, the same pipeline the teacher's
//! server binary wires up.

#[cfg(not(feature = "otel"))]
pub fn init() -> crate::Result<()> {
    tracing_subscriber::fmt::try_init()
        .map_err(|e| crate::Error::InvalidConfig(e.to_string()))
}

#[cfg(feature = "otel")]
pub fn init() -> crate::Result<()> {
    use opentelemetry::global;
    use opentelemetry::sdk::trace as sdktrace;
    use opentelemetry_aws::trace::XrayPropagator;
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    global::set_text_map_propagator(XrayPropagator::default());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(
            sdktrace::config()
                .with_sampler(sdktrace::Sampler::AlwaysOn)
                .with_id_generator(sdktrace::XrayIdGenerator::default()),
        )
        .install_simple()
        .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;

    let opentelemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    let filter = EnvFilter::from_default_env();

    tracing_subscriber::registry()
        .with(opentelemetry)
        .with(filter)
        .with(fmt::Layer::default())
        .try_init()
        .map_err(|e| crate::Error::InvalidConfig(e.to_string()))
}
