pub mod client;
pub mod clock;
pub mod config;
pub mod events;
mod session;
pub mod snapshot;
pub mod voting;

use tracing_subscriber::{fmt, EnvFilter};

pub use client::EventsClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ClientConfig;
pub use events::ChangeEvent;
pub use snapshot::Snapshot;

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default directives.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("m4e_client=debug,m4e_net=info,warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
