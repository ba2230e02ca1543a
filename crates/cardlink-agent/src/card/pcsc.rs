//! PC/SC backend: reader transport and the hardware event monitor.

use std::ffi::{CStr, CString};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use pcsc::{Card, Context, Protocols, ReaderState, Scope, ShareMode, State};
use tracing::{debug, warn};

use super::reader::{CardChannel, CardTransport, ReaderDriver, TransportError};

/// How long one status-change wait blocks before re-checking readers.
const STATUS_WAIT: Duration = Duration::from_secs(1);

/// Connection factory for a named PC/SC reader.
pub struct PcscTransport {
    context: Context,
    reader: CString,
}

struct PcscChannel {
    card: Card,
}

impl CardTransport for PcscTransport {
    fn connect(&self) -> Result<Box<dyn CardChannel>, TransportError> {
        let card = self
            .context
            .connect(&self.reader, ShareMode::Shared, Protocols::ANY)
            .map_err(|e| match e {
                pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard => {
                    TransportError::NoCard(e.to_string())
                }
                other => TransportError::Communication(other.to_string()),
            })?;
        Ok(Box::new(PcscChannel { card }))
    }
}

impl CardChannel for PcscChannel {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut buf = [0u8; pcsc::MAX_BUFFER_SIZE];
        let response = self.card.transmit(command, &mut buf).map_err(|e| match e {
            pcsc::Error::RemovedCard | pcsc::Error::ResetCard => {
                TransportError::NoCard(e.to_string())
            }
            other => TransportError::Communication(other.to_string()),
        })?;
        Ok(response.to_vec())
    }
}

/// Establish a PC/SC context and start feeding reader/card events into
/// `driver` from a dedicated thread.
///
/// Fails when the PC/SC service itself is unreachable.
pub fn spawn_monitor(driver: Arc<ReaderDriver>) -> Result<JoinHandle<()>, pcsc::Error> {
    let context = Context::establish(Scope::User)?;
    std::thread::Builder::new()
        .name("pcsc-monitor".into())
        .spawn(move || monitor_loop(&context, &driver))
        .map_err(|_| pcsc::Error::InternalError)
}

fn monitor_loop(context: &Context, driver: &ReaderDriver) {
    let mut states = vec![ReaderState::new(pcsc::PNP_NOTIFICATION(), State::UNAWARE)];
    let mut current: Option<CString> = None;

    loop {
        // Pick up newly plugged readers; keep the first one.
        if current.is_none() {
            match context.list_readers_owned() {
                Ok(readers) => {
                    if let Some(name) = readers.into_iter().next() {
                        attach(context, driver, &name);
                        states.push(ReaderState::new(name.clone(), State::UNAWARE));
                        current = Some(name);
                    }
                }
                Err(pcsc::Error::NoReadersAvailable) => {}
                Err(e) => warn!(error = %e, "Failed to list PC/SC readers"),
            }
        }

        for rs in &mut states {
            rs.sync_current_state();
        }

        match context.get_status_change(STATUS_WAIT, &mut states) {
            Ok(()) | Err(pcsc::Error::Timeout) => {}
            Err(e) => {
                warn!(error = %e, "PC/SC status wait failed");
                std::thread::sleep(STATUS_WAIT);
                continue;
            }
        }

        let mut detached = false;
        for rs in states.iter().skip(1) {
            let event = rs.event_state();
            if event.intersects(State::UNKNOWN | State::IGNORE) {
                detached = true;
            } else if event.contains(State::CHANGED) {
                if event.contains(State::PRESENT) {
                    driver.card_inserted();
                } else if event.contains(State::EMPTY) {
                    driver.card_removed();
                }
            }
        }

        if detached {
            driver.reader_detached();
            states.truncate(1);
            current = None;
        }
    }
}

fn attach(context: &Context, driver: &ReaderDriver, name: &CStr) {
    let display = name.to_string_lossy().into_owned();
    debug!(reader = %display, "PC/SC reader found");
    driver.reader_attached(
        display,
        Arc::new(PcscTransport {
            context: context.clone(),
            reader: name.to_owned(),
        }),
    );
}
