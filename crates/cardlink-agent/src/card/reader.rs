//! Card driver for a physical contact/contactless reader.
//!
//! Reader attachment and card presence are tracked as two independent pieces
//! of state, updated by hardware event callbacks and only read by
//! [`ReaderDriver::encode_card`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cardlink_core::config::CardConfig;

use super::apdu::{self, Response, Step};
use super::driver::{CardDriver, DeviceInfo, DeviceStatus, EncodeResult};
use super::layout::{CardLayout, CardPayload, LAYOUT_LEN};

/// Errors from the reader transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Reader communication failed: {0}")]
    Communication(String),

    #[error("Card not reachable: {0}")]
    NoCard(String),
}

/// Errors from one encode sequence.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Reader rejected {step}: status {sw1:02X} {sw2:02X}")]
    Status { step: Step, sw1: u8, sw2: u8 },

    #[error("Malformed reader response during {0}")]
    Malformed(Step),
}

/// An open connection to the card currently on the reader.
pub trait CardChannel: Send {
    /// Send one command and return the raw response (data + status word).
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// A reader that can open card connections.
pub trait CardTransport: Send + Sync {
    fn connect(&self) -> Result<Box<dyn CardChannel>, TransportError>;
}

/// Tunables for the reader driver.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub presence_timeout: Duration,
    pub presence_poll_interval: Duration,
    pub target_block: u8,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self::from(&CardConfig::default())
    }
}

impl From<&CardConfig> for ReaderConfig {
    fn from(config: &CardConfig) -> Self {
        Self {
            presence_timeout: config.presence_timeout(),
            presence_poll_interval: config.presence_poll_interval(),
            target_block: config.target_block,
        }
    }
}

#[derive(Clone)]
struct AttachedReader {
    name: String,
    transport: Arc<dyn CardTransport>,
}

/// [`CardDriver`] backed by a real reader.
pub struct ReaderDriver {
    config: ReaderConfig,
    reader: RwLock<Option<AttachedReader>>,
    card_present: AtomicBool,
    /// Held for the duration of one encode; the reader session is exclusive.
    session: Mutex<()>,
}

impl ReaderDriver {
    pub fn new(config: ReaderConfig) -> Self {
        Self {
            config,
            reader: RwLock::new(None),
            card_present: AtomicBool::new(false),
            session: Mutex::new(()),
        }
    }

    /// Hardware event: a reader became available.
    pub fn reader_attached(&self, name: impl Into<String>, transport: Arc<dyn CardTransport>) {
        let name = name.into();
        info!(reader = %name, "Card reader attached");
        *self.reader.write().unwrap_or_else(PoisonError::into_inner) =
            Some(AttachedReader { name, transport });
    }

    /// Hardware event: the reader went away. Any card on it goes too.
    pub fn reader_detached(&self) {
        let previous = self
            .reader
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.card_present.store(false, Ordering::SeqCst);
        if let Some(reader) = previous {
            info!(reader = %reader.name, "Card reader detached");
        }
    }

    /// Hardware event: a card was placed on the reader.
    pub fn card_inserted(&self) {
        debug!("Card presented");
        self.card_present.store(true, Ordering::SeqCst);
    }

    /// Hardware event: the card was taken off the reader.
    pub fn card_removed(&self) {
        debug!("Card removed");
        self.card_present.store(false, Ordering::SeqCst);
    }

    pub fn is_reader_attached(&self) -> bool {
        self.attached().is_some()
    }

    pub fn is_card_present(&self) -> bool {
        self.card_present.load(Ordering::SeqCst)
    }

    fn attached(&self) -> Option<AttachedReader> {
        self.reader
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Poll the presence flag until a card shows up, the reader goes away,
    /// or the presence timeout elapses.
    async fn wait_for_card(&self) -> bool {
        let deadline = Instant::now() + self.config.presence_timeout;
        loop {
            if self.is_card_present() {
                return true;
            }
            if !self.is_reader_attached() || Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.presence_poll_interval).await;
        }
    }
}

#[async_trait]
impl CardDriver for ReaderDriver {
    async fn encode_card(&self, payload: &CardPayload) -> EncodeResult {
        let Ok(_session) = self.session.try_lock() else {
            return EncodeResult::failure("Card reader is busy");
        };

        if !self.is_reader_attached() {
            return EncodeResult::failure("No card reader connected");
        }

        let layout = match CardLayout::from_payload(payload, Utc::now()) {
            Ok(layout) => layout,
            Err(e) => return EncodeResult::failure(e.to_string()),
        };

        if !self.wait_for_card().await {
            return EncodeResult::failure("No card detected");
        }

        let Some(reader) = self.attached() else {
            return EncodeResult::failure("No card reader connected");
        };

        let block = self.config.target_block;
        let data = layout.encode();
        let transport = Arc::clone(&reader.transport);
        let outcome =
            tokio::task::spawn_blocking(move || write_layout(transport.as_ref(), block, &data))
                .await;

        match outcome {
            Ok(Ok(card_uid)) => {
                info!(reader = %reader.name, card_uid = %card_uid, room = %layout.room, "Card encoded");
                EncodeResult::success(card_uid)
            }
            Ok(Err(e)) => {
                warn!(reader = %reader.name, error = %e, "Card encode failed");
                EncodeResult::failure(e.to_string())
            }
            Err(e) => EncodeResult::failure(format!("Encoder task failed: {e}")),
        }
    }

    fn status(&self) -> DeviceStatus {
        match self.attached() {
            Some(reader) => DeviceStatus {
                connected: true,
                device_info: Some(DeviceInfo {
                    name: reader.name,
                    driver: "pcsc".to_string(),
                    card_present: self.is_card_present(),
                }),
            },
            None => DeviceStatus::disconnected(),
        }
    }
}

/// Run the fixed encode sequence on one card connection.
///
/// Returns the card UID as upper-case hex.
pub fn write_layout(
    transport: &dyn CardTransport,
    block: u8,
    data: &[u8; LAYOUT_LEN],
) -> Result<String, EncodeError> {
    let mut channel = transport.connect()?;

    let uid = exchange(channel.as_mut(), Step::ReadUid, &apdu::get_uid())?;
    exchange(
        channel.as_mut(),
        Step::LoadKey,
        &apdu::load_key(apdu::VOLATILE_KEY_SLOT, &apdu::DEFAULT_KEY),
    )?;
    exchange(
        channel.as_mut(),
        Step::Authenticate,
        &apdu::authenticate(block, apdu::KEY_TYPE_A, apdu::VOLATILE_KEY_SLOT),
    )?;
    exchange(channel.as_mut(), Step::Write, &apdu::update_binary(block, data))?;

    Ok(hex::encode_upper(uid.data))
}

fn exchange(
    channel: &mut dyn CardChannel,
    step: Step,
    command: &[u8],
) -> Result<Response, EncodeError> {
    let raw = channel.transmit(command)?;
    let response = Response::parse(&raw).ok_or(EncodeError::Malformed(step))?;
    if !response.is_success() {
        return Err(EncodeError::Status {
            step,
            sw1: response.sw1,
            sw2: response.sw2,
        });
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::card::layout::CARD_MAGIC;

    /// Scripted transport recording every command it receives.
    #[derive(Default)]
    struct FakeTransport {
        responses: StdMutex<VecDeque<Vec<u8>>>,
        commands: Arc<StdMutex<Vec<Vec<u8>>>>,
    }

    impl FakeTransport {
        fn scripted(responses: Vec<Vec<u8>>) -> Arc<Self> {
            Arc::new(Self {
                responses: StdMutex::new(responses.into()),
                commands: Arc::default(),
            })
        }

        fn happy() -> Arc<Self> {
            Self::scripted(vec![
                vec![0x04, 0xA1, 0xB2, 0xC3, 0x90, 0x00],
                vec![0x90, 0x00],
                vec![0x90, 0x00],
                vec![0x90, 0x00],
            ])
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.commands.lock().unwrap().clone()
        }
    }

    struct FakeChannel {
        responses: Vec<Vec<u8>>,
        commands: Arc<StdMutex<Vec<Vec<u8>>>>,
    }

    impl CardChannel for FakeChannel {
        fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
            self.commands.lock().unwrap().push(command.to_vec());
            if self.responses.is_empty() {
                return Err(TransportError::NoCard("card removed".into()));
            }
            Ok(self.responses.remove(0))
        }
    }

    impl CardTransport for FakeTransport {
        fn connect(&self) -> Result<Box<dyn CardChannel>, TransportError> {
            let responses = self.responses.lock().unwrap().drain(..).collect();
            Ok(Box::new(FakeChannel {
                responses,
                commands: Arc::clone(&self.commands),
            }))
        }
    }

    fn quick_config() -> ReaderConfig {
        ReaderConfig {
            presence_timeout: Duration::from_millis(200),
            presence_poll_interval: Duration::from_millis(10),
            target_block: 4,
        }
    }

    fn payload() -> CardPayload {
        serde_json::from_value(serde_json::json!({
            "roomNumber": "101",
            "checkIn": "2024-01-01T14:00:00Z",
            "checkOut": "2024-01-03T11:00:00Z"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn no_reader_fails_fast() {
        let driver = ReaderDriver::new(ReaderConfig {
            presence_timeout: Duration::from_secs(10),
            ..quick_config()
        });
        let started = std::time::Instant::now();
        let result = driver.encode_card(&payload()).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("No card reader connected"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn reader_without_card_times_out() {
        let driver = ReaderDriver::new(quick_config());
        driver.reader_attached("ACR122U", FakeTransport::happy());

        let started = std::time::Instant::now();
        let result = driver.encode_card(&payload()).await;
        assert_eq!(result.error.as_deref(), Some("No card detected"));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn writes_layout_with_fixed_sequence() {
        let transport = FakeTransport::happy();
        let driver = ReaderDriver::new(quick_config());
        driver.reader_attached("ACR122U", transport.clone());
        driver.card_inserted();

        let result = driver.encode_card(&payload()).await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.card_uid.as_deref(), Some("04A1B2C3"));

        let sent = transport.sent();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0], apdu::get_uid());
        assert_eq!(sent[1], apdu::load_key(0, &apdu::DEFAULT_KEY));
        assert_eq!(sent[2], apdu::authenticate(4, apdu::KEY_TYPE_A, 0));
        assert_eq!(&sent[3][..5], &[0xFF, 0xD6, 0x00, 0x04, 0x10]);
        assert_eq!(&sent[3][5..9], &CARD_MAGIC);
        let decoded = CardLayout::decode(&sent[3][5..]).unwrap();
        assert_eq!(decoded.room, "101");
        assert_eq!(decoded.check_in, 1_704_117_600);
    }

    #[tokio::test]
    async fn card_tapped_during_wait_is_encoded() {
        let driver = Arc::new(ReaderDriver::new(ReaderConfig {
            presence_timeout: Duration::from_secs(2),
            ..quick_config()
        }));
        driver.reader_attached("ACR122U", FakeTransport::happy());

        let tapper = Arc::clone(&driver);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tapper.card_inserted();
        });

        let result = driver.encode_card(&payload()).await;
        assert!(result.success, "{result:?}");
    }

    #[tokio::test]
    async fn auth_failure_aborts_before_write() {
        let transport = FakeTransport::scripted(vec![
            vec![0x04, 0x11, 0x22, 0x33, 0x90, 0x00],
            vec![0x90, 0x00],
            vec![0x63, 0x00],
        ]);
        let driver = ReaderDriver::new(quick_config());
        driver.reader_attached("ACR122U", transport.clone());
        driver.card_inserted();

        let result = driver.encode_card(&payload()).await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("authenticate"), "{error}");
        assert!(error.contains("63 00"), "{error}");
        assert_eq!(transport.sent().len(), 3);
    }

    #[tokio::test]
    async fn detach_clears_card_presence() {
        let driver = ReaderDriver::new(quick_config());
        driver.reader_attached("ACR122U", FakeTransport::happy());
        driver.card_inserted();
        assert!(driver.status().device_info.unwrap().card_present);

        driver.reader_detached();
        assert!(!driver.is_card_present());
        assert_eq!(driver.status(), DeviceStatus::disconnected());
    }

    #[tokio::test]
    async fn concurrent_encode_is_rejected_as_busy() {
        let driver = Arc::new(ReaderDriver::new(ReaderConfig {
            presence_timeout: Duration::from_millis(300),
            ..quick_config()
        }));
        driver.reader_attached("ACR122U", FakeTransport::happy());

        // First call parks in the presence wait while holding the session.
        let first = {
            let driver = Arc::clone(&driver);
            tokio::spawn(async move { driver.encode_card(&payload()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = driver.encode_card(&payload()).await;
        assert_eq!(second.error.as_deref(), Some("Card reader is busy"));
        assert!(!first.await.unwrap().success);
    }

    #[tokio::test]
    async fn invalid_payload_is_reported() {
        let driver = ReaderDriver::new(quick_config());
        driver.reader_attached("ACR122U", FakeTransport::happy());
        driver.card_inserted();

        let bad = CardPayload {
            room_number: String::new(),
            check_in: None,
            check_out: None,
        };
        let result = driver.encode_card(&bad).await;
        assert!(result.error.unwrap().contains("room number is empty"));
    }
}
