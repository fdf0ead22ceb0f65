//! ---
//! dbc_section: "01-core-functionality"
//! dbc_subsection: "module"
//! dbc_type: "source"
//! dbc_scope: "code"
//! dbc_description: "Update-window sentinel for the BLE pairing subsystem."
//! dbc_version: "v0.0.0-prealpha"
//! dbc_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::Result;
use crate::state::{with_deadline, StateStore};

pub const BLE_KEY: &str = "ble";
pub const PIN_CODE_FIELD: &str = "pin-code";
pub const UPDATE_SENTINEL: &str = "UPDATE";

/// Sets and clears `ble.pin-code = "UPDATE"` while the update window is open.
#[derive(Clone)]
pub struct PinCodeGate {
    store: Arc<dyn StateStore>,
    timeout: Duration,
}

impl PinCodeGate {
    pub fn new(store: Arc<dyn StateStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn mark_update_window(&self) -> Result<()> {
        with_deadline(self.timeout, async {
            let mut conn = self.store.connect().await?;
            conn.hset(BLE_KEY, PIN_CODE_FIELD, UPDATE_SENTINEL).await
        })
        .await?;
        info!("ble pin-code set to {UPDATE_SENTINEL}");
        Ok(())
    }

    pub async fn clear_update_window(&self) -> Result<()> {
        with_deadline(self.timeout, async {
            let mut conn = self.store.connect().await?;
            conn.hdel(BLE_KEY, PIN_CODE_FIELD).await
        })
        .await?;
        info!("ble pin-code cleared");
        Ok(())
    }
}
