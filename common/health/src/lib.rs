use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

/// Liveness reporting for the long-lived loops inside a worker process.
///
/// Each loop registers itself with a deadline; the process is only
/// considered healthy while every registered component has reported
/// healthy within its deadline. A component that stops reporting (a stuck
/// poll, a deadlocked handler) flips the probe to unhealthy and the
/// orchestrator restarts the process.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True when all registered components are currently healthy.
    pub healthy: bool,
    /// Per-component status, for display in the probe body.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set when a component is newly registered.
    Starting,
    /// Recently reported healthy, must report again before the instant.
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy.
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        match self {
            ComponentStatus::HealthyUntil(until) => until.gt(&time::OffsetDateTime::now_utc()),
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Report healthy. Must be called more frequently than the deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            Err(_) => warn!("poisoned HealthRegistry lock"),
        }
    }
}

#[derive(Clone, Default)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register a component; the returned handle is passed to the component
    /// so it can report its own status.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Overall process status; usable directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        match self.components.read() {
            Ok(components) => HealthStatus {
                // Unhealthy until at least one component registered and all
                // registered components are within their deadlines.
                healthy: !components.is_empty() && components.values().all(|s| s.is_healthy()),
                components: components.clone(),
            },
            Err(_) => {
                warn!(registry = self.name, "poisoned HealthRegistry lock");
                HealthStatus::default()
            }
        }
    }
}
