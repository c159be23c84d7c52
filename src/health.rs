//! Health and metrics endpoints.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    let memory_info = get_memory_info();
    let live_sessions = state.sessions.len();
    let system_status = get_system_status(&config, live_sessions);

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "voice-relay",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_sessions": live_sessions,
            "total_sessions": metrics.total_sessions,
            "rejected_sessions": metrics.rejected_sessions,
            "total_barge_ins": metrics.total_barge_ins
        },
        "memory": memory_info,
        "upstream": {
            "connector": state.connector.describe(),
            "deployment": config.upstream.deployment,
            "voice": config.voice.voice_name,
            "configured": !config.upstream.endpoint.is_empty() && !config.upstream.api_key.is_empty()
        },
        "recordings": {
            "stored": state.recordings.len(),
            "capacity": config.performance.max_stored_recordings
        },
        "system": system_status
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_sessions": metrics.active_sessions,
            "total_sessions": metrics.total_sessions,
            "rejected_sessions": metrics.rejected_sessions,
            "total_barge_ins": metrics.total_barge_ins,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "sessions": state.sessions.summary(config.performance.max_concurrent_sessions),
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions,
            "max_stored_recordings": config.performance.max_stored_recordings
        }
    }))
}

fn get_memory_info() -> serde_json::Value {
    match read_proc_memory(process::id()) {
        Some((vm_rss, vm_size)) => json!({
            "resident_memory_bytes": vm_rss,
            "virtual_memory_bytes": vm_size,
            "available": true
        }),
        None => json!({
            "resident_memory_bytes": 0,
            "virtual_memory_bytes": 0,
            "available": false,
            "note": "Memory info not available on this platform"
        }),
    }
}

/// Resident and virtual size in bytes, from `/proc/<pid>/status`.
#[cfg(target_os = "linux")]
fn read_proc_memory(pid: u32) -> Option<(u64, u64)> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    let kb_field = |prefix: &str| {
        status
            .lines()
            .find(|line| line.starts_with(prefix))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    };
    Some((kb_field("VmRSS:"), kb_field("VmSize:")))
}

#[cfg(not(target_os = "linux"))]
fn read_proc_memory(_pid: u32) -> Option<(u64, u64)> {
    None
}

fn get_system_status(config: &crate::config::AppConfig, live_sessions: usize) -> serde_json::Value {
    let session_usage = if config.performance.max_concurrent_sessions > 0 {
        live_sessions as f64 / config.performance.max_concurrent_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": config.performance.max_concurrent_sessions,
        "current_sessions": live_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::test::{call_and_read_body_json, init_service, TestRequest};
    use actix_web::App;

    #[actix_web::test]
    async fn test_health_reports_upstream_and_sessions() {
        let app = init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/health", web::get().to(health_check)),
        )
        .await;
        let req = TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"]["name"], "voice-relay");
        assert_eq!(body["upstream"]["connector"], "unreachable");
        assert_eq!(body["upstream"]["configured"], false);
        assert_eq!(body["metrics"]["active_sessions"], 0);
        assert_eq!(body["system"]["status"], "normal");
    }

    #[test]
    fn test_load_levels() {
        let config = crate::config::AppConfig::default();
        assert_eq!(get_system_status(&config, 10)["status"], "high_load");
        assert_eq!(get_system_status(&config, 8)["status"], "moderate_load");
        assert_eq!(get_system_status(&config, 1)["load_warnings"].as_array().map(Vec::len), Some(0));
    }
}
