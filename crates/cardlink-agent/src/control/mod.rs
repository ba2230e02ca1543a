//! Local control API and its loopback HTTP router.

mod api;
mod router;

pub use api::{
    ControlApi, EncodeRequest, PairRequest, PairResponse, PairingStatus, QueueStatus,
    QueuedJobView,
};
pub use router::build_router;
