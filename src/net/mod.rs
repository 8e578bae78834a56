//! Connection management for the server core.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Protocol handler                         │
//! │        on_connect / on_data / on_disconnect callbacks        │
//! └──────────────┬───────────────────────────────▲───────────────┘
//!                │ Verdict                       │ buffered input
//!                ▼                               │
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ConnectionTable   slot = descriptor, generation-checked ids │
//! │  Connection        socket + pooled buffers + session         │
//! │  Completions       worker → main loop hand-back              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The table and timers belong to the main loop. Workers only ever see an
//! `Arc<Connection>` and the completion queue.

pub mod completion;
pub mod connection;
pub mod table;
pub mod traits;

pub use completion::{Completion, CompletionGuard, Completions, Outcome};
pub use connection::{Connection, Fill, Flush};
pub use table::{ConnectionTable, Released, SlotState};
pub use traits::{ConnectionHandler, ConnectionId, Verdict};
