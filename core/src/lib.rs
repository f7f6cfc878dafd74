//! Discovery-and-tracking pipeline: target matching, stream processing, liveness,
//! the asset ledger contract and the per-candidate scan coordinator.

pub mod admission;
pub mod coordinator;
pub mod join;
pub mod ledger;
pub mod liveness;
pub mod matcher;
pub mod model;
pub mod notify;
pub mod probe;
pub mod stream;

pub use admission::{Admission, AdmissionLimits};
pub use coordinator::{Outcome, ScanCoordinator, UnitError, Verdict};
pub use ledger::{Ledger, LedgerError, MemoryLedger};
pub use liveness::{DnsResolver, Resolver};
pub use matcher::{CompileError, TargetSet, Targets};
pub use model::{base_domain, Domain, Port, Subdomain};
pub use notify::{Notification, Notifier, NotifyError};
pub use probe::{PortFinding, PortScanner, ProbeError, TakeoverChecker};
pub use stream::{dedupe, CertificateEvent, DecodeError, FeedItem, StreamProcessor, StreamStats};

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
