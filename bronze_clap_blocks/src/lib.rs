//! Building blocks for [`clap`]-driven configuration of the bronze pipeline.
//!
//! Every block reads its flags from the command line with an environment variable fallback, so a
//! deployment can be configured entirely through `BRONZE_*` variables (or a `.env` file).

pub mod capture;
pub mod channel;
pub mod object_store;
pub mod retry;
pub mod socket_addr;
pub mod tokio;
