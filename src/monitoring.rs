use crate::metrics::StreamSnapshot;
use crate::pingpong::Measurement;
use actix_web::{dev::Server, get, App, HttpResponse, HttpServer, Responder};
use paste::paste;
use prometheus::{
    register_gauge_vec, register_int_gauge, GaugeVec, IntGauge, TextEncoder,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use tracing::info;
use tracing_actix_web::TracingLogger;

macro_rules! static_prom {
    ($name:ident, $kind: ty, $create:expr) => {
        paste! {
            fn $name() -> &'static $kind {
                static [<$name:upper>]: OnceLock<$kind> = OnceLock::new();
                [<$name:upper>].get_or_init(|| { $create })
            }
        }
    };
}

// Global prometheus state variables
static_prom!(
    udp_packet_gauge,
    IntGauge,
    register_int_gauge!("udp_packets", "Number of datagrams we've received").unwrap()
);
static_prom!(
    handled_gauge,
    IntGauge,
    register_int_gauge!("handled_packets", "Datagrams consumed by a translator").unwrap()
);
static_prom!(
    unknown_gauge,
    IntGauge,
    register_int_gauge!("unknown_packets", "Datagrams no translator recognized").unwrap()
);
static_prom!(
    error_gauge,
    IntGauge,
    register_int_gauge!("translator_errors", "Packets that made a translator fail").unwrap()
);
static_prom!(
    loss_gauge,
    GaugeVec,
    register_gauge_vec!(
        "stream_loss_rate",
        "Fraction of packets lost per stream",
        &["device", "kind"]
    )
    .unwrap()
);
static_prom!(
    rate_gauge,
    GaugeVec,
    register_gauge_vec!(
        "stream_rate_hz",
        "Packet arrival rate over the short window",
        &["device", "kind"]
    )
    .unwrap()
);
static_prom!(
    jitter_gauge,
    GaugeVec,
    register_gauge_vec!(
        "stream_jitter_ms",
        "Inter-arrival jitter over the short window",
        &["device", "kind"]
    )
    .unwrap()
);
static_prom!(
    rtt_gauge,
    GaugeVec,
    register_gauge_vec!("device_rtt_ms", "Ping-pong round trip per device", &["device"]).unwrap()
);
static_prom!(
    offset_gauge,
    GaugeVec,
    register_gauge_vec!(
        "device_offset_ms",
        "Ping-pong clock offset per device",
        &["device"]
    )
    .unwrap()
);

/// Counter block the ingress loop hands over on every heartbeat
#[derive(Debug, Clone, Copy, Default)]
pub struct IngressCounters {
    pub udp_pkts: u64,
    pub handled: u64,
    pub unknown: u64,
    pub errors: u64,
}

/// Publish the latest ingress state to the gauges
pub fn update_ingress(
    counters: IngressCounters,
    snapshot: &BTreeMap<String, StreamSnapshot>,
    timesync: &HashMap<String, Measurement>,
) {
    udp_packet_gauge().set(counters.udp_pkts.try_into().unwrap_or(i64::MAX));
    handled_gauge().set(counters.handled.try_into().unwrap_or(i64::MAX));
    unknown_gauge().set(counters.unknown.try_into().unwrap_or(i64::MAX));
    error_gauge().set(counters.errors.try_into().unwrap_or(i64::MAX));
    for (key, s) in snapshot {
        let Some((device, kind)) = key.split_once('|') else {
            continue;
        };
        loss_gauge()
            .with_label_values(&[device, kind])
            .set(s.pkts.loss_rate);
        rate_gauge()
            .with_label_values(&[device, kind])
            .set(s.ia_10s.rate_hz);
        jitter_gauge()
            .with_label_values(&[device, kind])
            .set(s.ia_10s.jitter_ms);
    }
    for (device, m) in timesync {
        rtt_gauge().with_label_values(&[device]).set(m.rtt_ms);
        offset_gauge().with_label_values(&[device]).set(m.offset_ms);
    }
}

#[get("/metrics")]
async fn metrics() -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    HttpResponse::Ok().body(encoder.encode_to_string(&metric_families).unwrap())
}

pub fn start_web_server(metrics_port: u16) -> eyre::Result<Server> {
    info!("Starting metrics webserver");
    // Create the server coroutine
    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default()) // Tracing middleware
            .service(metrics)
    })
    .bind(("0.0.0.0", metrics_port))?
    .workers(1)
    .run();
    // And return the coroutine for the caller to spawn
    Ok(server)
}
