//! Health snapshot and the periodic supervisor that acts on it

use super::sip_manager::SipManager;
use crate::domain::registration::ConnectionState;
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Read-only diagnostic of a [`SipManager`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub state: ConnectionState,
    pub transport_active: bool,
    pub has_credentials: bool,
    pub dispatcher_registered: bool,
    pub re_registration_timer_active: bool,
    pub reconnect_scheduled: bool,
    /// False when registered without a live transport or dispatcher
    pub healthy: bool,
}

impl HealthReport {
    pub fn new(
        state: ConnectionState,
        transport_active: bool,
        has_credentials: bool,
        dispatcher_registered: bool,
        re_registration_timer_active: bool,
        reconnect_scheduled: bool,
    ) -> Self {
        let lost_binding =
            state == ConnectionState::Registered && !(transport_active && dispatcher_registered);

        Self {
            state,
            transport_active,
            has_credentials,
            dispatcher_registered,
            re_registration_timer_active,
            reconnect_scheduled,
            healthy: !lost_binding,
        }
    }
}

/// Poll `manager` every `interval`, forcing a restart on a lost binding
pub(crate) fn spawn_supervisor(manager: SipManager, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let report = manager.check_health();
            debug!(
                "Health: state={} transport={} dispatcher={} reregister={} reconnect={}",
                report.state,
                report.transport_active,
                report.dispatcher_registered,
                report.re_registration_timer_active,
                report.reconnect_scheduled
            );

            if !report.healthy {
                warn!("Registered without a live transport, forcing restart");
                manager.start().await;
            }
        }
    })
}
