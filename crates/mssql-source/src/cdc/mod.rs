//! SQL Server change data capture.
//!
//! - [`Lsn`] is the position type
//! - [`CdcTracker`] reads the change tables of the tracked capture instances
//!   a page at a time and tracks the last fully delivered commit
//! - [`activate_capture`] enables capture for tables that have none
//! - [`run_cdc_session`] replays everything up to the current maximum LSN
//!   into the sink

mod activation;
mod lsn;
mod session;
mod tracker;

pub use activation::{activate_capture, check_prerequisites};
pub use lsn::{Lsn, LsnError};
pub use session::{run_cdc_session, CdcOutcome};
pub use tracker::{
    add_cdc_metadata, list_capture_instances, CaptureInstance, CdcTracker, ChangeEvent,
    ChangeOperation, ChangeReplay, TrackedStream, CDC_DELETED_AT, CDC_LSN, CDC_UPDATED_AT,
    DEFAULT_CHANGE_PAGE_SIZE,
};
