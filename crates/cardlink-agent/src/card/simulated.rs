//! Hardware-free driver for development and demos.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::info;

use super::driver::{CardDriver, DeviceInfo, DeviceStatus, EncodeResult};
use super::layout::{CardLayout, CardPayload};

/// Pretends a card was encoded after a fixed delay and returns a random UID.
pub struct SimulatedDriver {
    delay: Duration,
    session: Mutex<()>,
}

impl SimulatedDriver {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            session: Mutex::new(()),
        }
    }
}

#[async_trait]
impl CardDriver for SimulatedDriver {
    async fn encode_card(&self, payload: &CardPayload) -> EncodeResult {
        let Ok(_session) = self.session.try_lock() else {
            return EncodeResult::failure("Card reader is busy");
        };

        let layout = match CardLayout::from_payload(payload, Utc::now()) {
            Ok(layout) => layout,
            Err(e) => return EncodeResult::failure(e.to_string()),
        };

        tokio::time::sleep(self.delay).await;

        let card_uid = format!("{:08X}", rand::random::<u32>());
        info!(card_uid = %card_uid, room = %layout.room, "Simulated card encoded");
        EncodeResult::success(card_uid)
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus {
            connected: true,
            device_info: Some(DeviceInfo {
                name: "Simulated reader".to_string(),
                driver: "simulated".to_string(),
                card_present: true,
            }),
        }
    }
}
