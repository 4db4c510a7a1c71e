//! Layer constructors and simulator spans
//!
//! Device actors run inside [`device_span`], so every log line they emit
//! carries `device_id` and `role` without repeating them at each call site.

use netsim_core::{DeviceId, DeviceRole};
use tracing::{Span, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;
use uuid::Uuid;

use crate::config::JsonlConfig;

/// Boxed layer over any subscriber that supports span lookup
pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// JSONL formatting layer writing to `writer`
pub fn jsonl_layer<S, W>(writer: W, config: &JsonlConfig) -> BoxedLayer<S>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup> + 'static,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(config.include_current_span)
        .with_span_list(config.include_spans)
        .flatten_event(config.flatten_events)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_thread_ids(config.include_thread_info)
        .with_thread_names(config.include_thread_info)
        .with_writer(writer)
        .boxed()
}

/// Human-readable console layer
pub fn pretty_layer<S>(ansi: bool) -> BoxedLayer<S>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup> + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_ansi(ansi)
        .with_target(true)
        .boxed()
}

/// Span for one device actor
pub fn device_span(device: &DeviceId, role: DeviceRole) -> Span {
    tracing::info_span!("device", device_id = %device, role = %role)
}

/// Span for one simulation run. Returns the span and its run id.
pub fn run_span(name: &str) -> (Span, Uuid) {
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("run", run_id = %run_id, scenario = %name);
    (span, run_id)
}
